//! Queue service client abstraction.
//!
//! The worker core is written against the [`QueueClient`] trait so any
//! backend satisfying the receive/extend/delete contract can drive it. Two
//! implementations ship with the crate:
//!
//! - [`memory::InMemoryQueue`]: process-local, used by the test suite
//! - [`redis::RedisQueue`]: Redis-backed, used by the CLI
//!
//! Batch calls accept at most [`BATCH_LIMIT`] entries and return partial
//! results; individual entry failures never fail the whole call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

pub mod memory;
pub mod redis;

/// Maximum entries accepted by one batch call.
pub const BATCH_LIMIT: usize = 10;

/// Attribute name for visible message count.
pub const ATTR_VISIBLE: &str = "ApproximateNumberOfMessages";

/// Attribute name for in-flight (received, not yet acknowledged) count.
pub const ATTR_NOT_VISIBLE: &str = "ApproximateNumberOfMessagesNotVisible";

/// Attribute name for delayed message count.
pub const ATTR_DELAYED: &str = "ApproximateNumberOfMessagesDelayed";

/// Attribute name for the default visibility timeout of a queue.
pub const ATTR_VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";

/// Attribute name for the redrive policy of a queue.
pub const ATTR_REDRIVE_POLICY: &str = "RedrivePolicy";

/// A resolved (logical name, concrete locator) binding.
///
/// Immutable once resolved; a resolution cycle regenerates pairs wholesale.
/// Role (primary / failure / dead-letter / FIFO) is derived from the name's
/// suffix by convention, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueuePair {
    /// Full queue name, prefix included.
    pub name: String,
    /// Backend-specific locator for the queue.
    pub locator: String,
}

impl QueuePair {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
        }
    }

    /// Whether this queue holds redriven failures.
    pub fn is_failure(&self, suffixes: &QueueSuffixes) -> bool {
        let base = self.base_name(suffixes);
        base.ends_with(&suffixes.failure)
    }

    /// Whether this queue is a dead-letter queue.
    pub fn is_dead_letter(&self, suffixes: &QueueSuffixes) -> bool {
        let base = self.base_name(suffixes);
        base.ends_with(&suffixes.dead_letter)
    }

    /// Whether this queue is FIFO.
    pub fn is_fifo(&self, suffixes: &QueueSuffixes) -> bool {
        self.name.ends_with(&suffixes.fifo)
    }

    /// The name with any FIFO suffix stripped, so role suffixes can be
    /// checked on FIFO queues too (`jobs_failed.fifo` is a failure queue).
    fn base_name<'a>(&'a self, suffixes: &QueueSuffixes) -> &'a str {
        self.name
            .strip_suffix(&suffixes.fifo)
            .unwrap_or(&self.name)
    }
}

/// Suffix conventions deriving queue roles from names.
#[derive(Debug, Clone)]
pub struct QueueSuffixes {
    /// Suffix of failure queues.
    pub failure: String,
    /// Suffix of dead-letter queues.
    pub dead_letter: String,
    /// Suffix of FIFO queues.
    pub fifo: String,
}

impl Default for QueueSuffixes {
    fn default() -> Self {
        Self {
            failure: "_failed".to_string(),
            dead_letter: "_dead".to_string(),
            fifo: ".fifo".to_string(),
        }
    }
}

/// One received message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Identifier unique per receive, assigned by the queue service.
    pub message_id: String,
    /// Opaque token required to act on this specific delivery.
    pub receipt_handle: String,
    /// Raw message payload.
    pub body: String,
    /// FIFO message group id, if any.
    pub group_id: Option<String>,
}

/// Options for a single send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// FIFO message group id.
    pub group_id: Option<String>,
}

/// One entry of a batched send.
#[derive(Debug, Clone)]
pub struct SendEntry {
    /// Caller-assigned id used to correlate batch results.
    pub id: String,
    /// Message payload.
    pub body: String,
    /// FIFO message group id.
    pub group_id: Option<String>,
}

/// One entry of a batched visibility change.
#[derive(Debug, Clone)]
pub struct VisibilityEntry {
    /// Message identifier, used to correlate batch results.
    pub id: String,
    /// Receipt handle of the delivery to extend.
    pub receipt_handle: String,
    /// New visibility timeout in seconds, from now.
    pub timeout_secs: u32,
}

/// One entry of a batched delete.
#[derive(Debug, Clone)]
pub struct DeleteEntry {
    /// Message identifier, used to correlate batch results.
    pub id: String,
    /// Receipt handle of the delivery to delete.
    pub receipt_handle: String,
}

/// Partial result of a batch call.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Ids of entries the service accepted.
    pub successful: Vec<String>,
    /// Entries the service rejected, with reasons.
    pub failed: Vec<BatchFailure>,
}

/// A single rejected batch entry.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub id: String,
    pub reason: String,
}

/// Client for a managed queue service.
///
/// Implementations are injected as `Arc<dyn QueueClient>`; the worker never
/// constructs one itself.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Lists queue names sharing `prefix`. Pagination, where the backend
    /// has it, is handled internally.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, QueueError>;

    /// Looks up the locator for an exact queue name.
    async fn get_queue(&self, name: &str) -> Result<Option<String>, QueueError>;

    /// Creates a queue (idempotent) and returns its locator.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError>;

    /// Sends one message; returns the service-assigned message id.
    async fn send(
        &self,
        queue: &QueuePair,
        body: &str,
        opts: &SendOptions,
    ) -> Result<String, QueueError>;

    /// Sends up to [`BATCH_LIMIT`] messages in one call.
    async fn send_batch(
        &self,
        queue: &QueuePair,
        entries: &[SendEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Receives up to `max` messages, long-polling up to `wait`.
    async fn receive(
        &self,
        queue: &QueuePair,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    /// Changes the visibility timeout of one in-flight delivery.
    async fn change_visibility(
        &self,
        queue: &QueuePair,
        receipt_handle: &str,
        timeout_secs: u32,
    ) -> Result<(), QueueError>;

    /// Changes visibility timeouts for up to [`BATCH_LIMIT`] deliveries.
    async fn change_visibility_batch(
        &self,
        queue: &QueuePair,
        entries: &[VisibilityEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Deletes up to [`BATCH_LIMIT`] deliveries.
    async fn delete_batch(
        &self,
        queue: &QueuePair,
        entries: &[DeleteEntry],
    ) -> Result<BatchResult, QueueError>;

    /// Reads the named attributes of a queue.
    async fn get_attributes(
        &self,
        queue: &QueuePair,
        names: &[&str],
    ) -> Result<HashMap<String, String>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> QueueSuffixes {
        QueueSuffixes::default()
    }

    #[test]
    fn test_queue_pair_roles() {
        let s = suffixes();

        let primary = QueuePair::new("qrelay_jobs", "loc");
        assert!(!primary.is_failure(&s));
        assert!(!primary.is_dead_letter(&s));
        assert!(!primary.is_fifo(&s));

        let failure = QueuePair::new("qrelay_jobs_failed", "loc");
        assert!(failure.is_failure(&s));
        assert!(!failure.is_fifo(&s));

        let dead = QueuePair::new("qrelay_jobs_dead", "loc");
        assert!(dead.is_dead_letter(&s));

        let fifo = QueuePair::new("qrelay_jobs.fifo", "loc");
        assert!(fifo.is_fifo(&s));
        assert!(!fifo.is_failure(&s));
    }

    #[test]
    fn test_fifo_failure_queue_is_both() {
        let s = suffixes();
        let pair = QueuePair::new("qrelay_jobs_failed.fifo", "loc");
        assert!(pair.is_fifo(&s));
        assert!(pair.is_failure(&s));
    }
}
