//! The worker core: receive, execute, keep the lease alive, reconcile.
//!
//! - **QueueResolver**: expands queue patterns into the current queue set
//! - **PollingScheduler**: one poll loop per selected queue
//! - **JobRunner**: executes one job under a hard kill deadline
//! - **LeaseManager**: batched visibility extension and deletion
//!
//! # Data flow
//!
//! ```text
//!   patterns ──▶ QueueResolver ──▶ queue set
//!                                     │ one poll loop each
//!                                     ▼
//!   receive ──▶ LeaseManager.register ──▶ JobRunner
//!                     ▲                      │ outcome
//!                     └──────────────────────┘
//!       success → batched delete │ failure → leave for redrive
//!       refusal → visibility 0, immediate return
//! ```
//!
//! The scheduler owns the delete/release decision; the runner never touches
//! the queue. All loops observe one shared cancellation token and drain
//! in-flight work before returning.

pub mod job;
pub mod lease;
pub mod resolver;
pub mod runner;
pub mod scheduler;

// Re-export main types for convenience
pub use job::{Job, JobOutcome, JobStatus, RunStats, StatsSnapshot};
pub use lease::{LeaseManager, MAX_JOB_RUN_SECS};
pub use resolver::{QueueResolver, ResolveOptions};
pub use runner::{JobError, JobHandler, JobRunner, RunnerOptions};
pub use scheduler::PollingScheduler;
