//! qrelay: a command-line job queue worker.
//!
//! This library provides the pieces for enqueueing shell commands as queue
//! messages and running them with a worker that keeps each message's
//! visibility lease alive for as long as the job runs.

// Core modules
pub mod cli;
pub mod config;
pub mod dedup;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod idle;
pub mod queue;
pub mod shutdown;
pub mod worker;

// Re-export commonly used error types
pub use error::{EnqueueError, QueueError, ResolveError, RunnerError, WorkerError};
