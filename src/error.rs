//! Error types for qrelay operations.
//!
//! Defines error types for the major subsystems:
//! - Queue service client operations
//! - Queue name resolution
//! - Job execution
//! - Worker lifecycle (lease tracking, polling)
//! - Enqueueing

use thiserror::Error;

/// Errors that can occur during queue service operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the queue backend.
    #[error("Queue backend connection failed: {0}")]
    ConnectionFailed(String),

    /// The named queue does not exist.
    ///
    /// Right after queue creation the backend may briefly report this even
    /// though the queue exists; callers retry at the next cycle.
    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    /// A receipt handle no longer refers to an in-flight delivery.
    #[error("Receipt handle '{0}' is not in flight")]
    ReceiptNotInFlight(String),

    /// A batch call was given more entries than the service accepts.
    #[error("Batch of {0} entries exceeds the per-call limit of {1}")]
    BatchTooLarge(usize, usize),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize message data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while resolving queue name patterns.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A pattern contained more than one wildcard.
    #[error("Pattern '{0}' has more than one '*'")]
    MultipleWildcards(String),

    /// The sanitized pattern could not be compiled.
    #[error("Pattern '{pattern}' is not matchable: {reason}")]
    BadPattern { pattern: String, reason: String },

    /// Queue service failure during resolution.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors that can occur while launching or supervising a job subprocess.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The shell process could not be spawned.
    #[error("Failed to spawn job process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the child process failed.
    #[error("Failed to wait on job process: {0}")]
    Wait(#[source] std::io::Error),

    /// Signalling the job's process group failed.
    #[error("Failed to signal job process group {pgid}: {errno}")]
    Signal { pgid: i32, errno: nix::errno::Errno },
}

/// Errors raised by the worker core.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A message identifier was received while a job for the same identifier
    /// is still tracked. This means the lease-extension loop fell behind and
    /// the queue redelivered a message we believe is in flight; it is fatal
    /// for that job and must never be silently absorbed.
    #[error(
        "Duplicate receipt of message '{message_id}' on queue '{queue}': \
         a job for it has been running for {running_for_secs}s"
    )]
    DuplicateReceipt {
        message_id: String,
        queue: String,
        running_for_secs: u64,
    },

    /// Tried to act on a message identifier that is not tracked.
    #[error("Message '{0}' is not tracked")]
    UnknownJob(String),

    /// Queue service failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Resolution failure.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Job execution failure outside the job itself.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Errors that can occur while enqueueing commands.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// FIFO queues require a message group id.
    #[error("Queue '{0}' is FIFO but no group id was given")]
    MissingGroupId(String),

    /// Failed to read a batch command file.
    #[error("Failed to read command file '{path}': {source}")]
    BatchFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Queue service failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_receipt_display_references_existing_job() {
        let err = WorkerError::DuplicateReceipt {
            message_id: "m-1".to_string(),
            queue: "qrelay_test".to_string(),
            running_for_secs: 42,
        };
        let text = err.to_string();
        assert!(text.contains("m-1"));
        assert!(text.contains("qrelay_test"));
        assert!(text.contains("42"));
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::QueueNotFound("qrelay_missing".to_string());
        assert!(err.to_string().contains("qrelay_missing"));

        let err = QueueError::BatchTooLarge(12, 10);
        assert!(err.to_string().contains("12"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::MultipleWildcards("a*b*".to_string());
        assert!(err.to_string().contains("a*b*"));
    }
}
