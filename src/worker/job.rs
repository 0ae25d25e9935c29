//! Job types for the worker.
//!
//! - `Job`: one in-flight unit of work and its lease bookkeeping
//! - `JobStatus`: the per-job state machine
//! - `JobOutcome`: terminal result reported by the runner
//! - `RunStats`: run-wide counters surfaced at shutdown

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;

use crate::queue::QueuePair;

/// Per-job state machine.
///
/// `Waiting -> Running -> {Complete | Failed} -> Deleting`, with a
/// distinguished `Refused` exit that bypasses `Deleting` entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Registered, not yet handed to the runner.
    Waiting,
    /// Executing.
    Running,
    /// Finished successfully; queued for batched delete.
    Complete,
    /// Finished unsuccessfully; left for the queue's redrive policy.
    Failed,
    /// Handler declined the message; returned to immediate visibility.
    Refused,
    /// Delete issued; dropped from tracking once the cycle ends.
    Deleting,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Refused => write!(f, "refused"),
            JobStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// One in-flight unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    /// Identifier unique per receive, assigned by the queue service.
    pub message_id: String,
    /// Token required to act on this specific delivery.
    pub receipt_handle: String,
    /// Queue the message was received from.
    pub queue: QueuePair,
    /// Raw command payload.
    pub payload: String,
    /// FIFO message group id, if any.
    pub group_id: Option<String>,
    /// When the job was registered.
    pub started_at: Instant,
    /// Current queue-side visibility timeout.
    pub visibility_timeout_secs: u32,
    /// Runtime offset at which the next extension should fire.
    pub extend_at_secs: u64,
    /// Current status.
    pub status: JobStatus,
}

impl Job {
    /// Seconds since the job was registered.
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Terminal outcome of one job execution.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Exit status 0 (or a normal handler return).
    Success { stdout: String, stderr: String },
    /// Non-zero exit, termination by signal, or an execution error.
    Failure {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        /// Execution-level error (spawn failure, handler error), if any.
        error: Option<String>,
    },
    /// Handler signalled "do not process"; only possible in callback mode.
    Refused,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

/// Run-wide counters.
///
/// Accumulated additively across poll cycles; reset only at process start;
/// read at shutdown for the final report.
#[derive(Debug, Default)]
pub struct RunStats {
    no_jobs: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an empty receive.
    pub fn record_empty(&self) {
        self.no_jobs.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a successful job.
    pub fn record_success(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a failed job.
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            no_jobs: self.no_jobs.load(Ordering::SeqCst),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
        }
    }
}

/// Final counter values reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Receives that returned no message.
    pub no_jobs: u64,
    /// Jobs that completed successfully.
    pub jobs_succeeded: u64,
    /// Jobs that failed. Refused jobs count nowhere.
    pub jobs_failed: u64,
}

impl StatsSnapshot {
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed
    }
}
