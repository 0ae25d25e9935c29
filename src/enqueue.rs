//! The enqueue path: queue provisioning and command submission.
//!
//! Enqueueing a command ensures the target queue and its failure companion
//! exist (wiring the redrive policy so repeatedly-failing messages land on
//! the companion), optionally suppresses duplicates by content hash, and
//! sends single commands or whole newline-delimited batch files.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::EnqueueOptions;
use crate::dedup::{content_key, DedupCache};
use crate::error::EnqueueError;
use crate::queue::{
    QueueClient, QueuePair, SendEntry, SendOptions, ATTR_REDRIVE_POLICY, ATTR_VISIBILITY_TIMEOUT,
    BATCH_LIMIT,
};

/// Result of a single send.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Sent; carries the service-assigned message id.
    Sent { message_id: String },
    /// Suppressed by the content-hash dedup cache.
    Deduplicated,
}

/// Result of a batch-file enqueue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EnqueueSummary {
    /// Commands sent.
    pub sent: usize,
    /// Commands suppressed by deduplication.
    pub deduplicated: usize,
}

/// Sends commands to queues, provisioning them on first use.
pub struct Enqueuer {
    client: Arc<dyn QueueClient>,
    dedup: Option<Arc<dyn DedupCache>>,
    opts: EnqueueOptions,
}

impl Enqueuer {
    pub fn new(client: Arc<dyn QueueClient>, opts: EnqueueOptions) -> Self {
        Self {
            client,
            dedup: None,
            opts,
        }
    }

    /// Attaches a dedup cache; only consulted when `opts.dedup` is set.
    pub fn with_dedup_cache(mut self, cache: Arc<dyn DedupCache>) -> Self {
        self.dedup = Some(cache);
        self
    }

    /// Creates the queue and its failure companion if needed.
    ///
    /// The companion is created first so the primary's redrive policy can
    /// point at it.
    pub async fn ensure_queue(&self, queue: &str) -> Result<QueuePair, EnqueueError> {
        let name = self.full_name(queue);
        let failure_name = failure_companion(&name, &self.opts.suffixes.failure, &self.opts.suffixes.fifo);

        let mut failure_attrs = HashMap::new();
        failure_attrs.insert(ATTR_VISIBILITY_TIMEOUT.to_string(), "30".to_string());
        let failure_locator = self
            .client
            .create_queue(&failure_name, &failure_attrs)
            .await?;

        let mut attrs = HashMap::new();
        attrs.insert(ATTR_VISIBILITY_TIMEOUT.to_string(), "30".to_string());
        attrs.insert(
            ATTR_REDRIVE_POLICY.to_string(),
            serde_json::json!({
                "maxReceiveCount": self.opts.max_receive_count,
                "deadLetterTargetArn": failure_locator,
            })
            .to_string(),
        );
        let locator = self.client.create_queue(&name, &attrs).await?;
        debug!(queue = %name, failure_queue = %failure_name, "Queues ensured");
        Ok(QueuePair::new(name, locator))
    }

    /// Sends one command.
    pub async fn send_command(
        &self,
        queue: &str,
        command: &str,
    ) -> Result<SendOutcome, EnqueueError> {
        let pair = self.ensure_queue(queue).await?;
        if pair.is_fifo(&self.opts.suffixes) && self.opts.group_id.is_none() {
            return Err(EnqueueError::MissingGroupId(pair.name));
        }
        if self.suppressed(command).await? {
            info!(queue = %pair.name, "Command deduplicated");
            return Ok(SendOutcome::Deduplicated);
        }
        let message_id = self
            .client
            .send(
                &pair,
                command,
                &SendOptions {
                    group_id: self.opts.group_id.clone(),
                },
            )
            .await?;
        info!(queue = %pair.name, message_id = %message_id, "Command enqueued");
        Ok(SendOutcome::Sent { message_id })
    }

    /// Sends every command in a newline-delimited file.
    ///
    /// Blank lines and `#` comments are skipped; sends go out in chunks of
    /// the service batch limit.
    pub async fn send_batch_file(
        &self,
        queue: &str,
        path: &Path,
    ) -> Result<EnqueueSummary, EnqueueError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| EnqueueError::BatchFile {
                    path: path.display().to_string(),
                    source,
                })?;

        let pair = self.ensure_queue(queue).await?;
        if pair.is_fifo(&self.opts.suffixes) && self.opts.group_id.is_none() {
            return Err(EnqueueError::MissingGroupId(pair.name));
        }

        let mut summary = EnqueueSummary::default();
        let mut pending: Vec<SendEntry> = Vec::new();
        for line in contents.lines() {
            let command = line.trim();
            if command.is_empty() || command.starts_with('#') {
                continue;
            }
            if self.suppressed(command).await? {
                summary.deduplicated += 1;
                continue;
            }
            pending.push(SendEntry {
                id: summary.sent.to_string(),
                body: command.to_string(),
                group_id: self.opts.group_id.clone(),
            });
            summary.sent += 1;
            if pending.len() == BATCH_LIMIT {
                self.client.send_batch(&pair, &pending).await?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.client.send_batch(&pair, &pending).await?;
        }
        info!(
            queue = %pair.name,
            sent = summary.sent,
            deduplicated = summary.deduplicated,
            "Batch file enqueued"
        );
        Ok(summary)
    }

    async fn suppressed(&self, command: &str) -> Result<bool, EnqueueError> {
        if !self.opts.dedup {
            return Ok(false);
        }
        let Some(cache) = &self.dedup else {
            return Ok(false);
        };
        let fresh = cache
            .check_and_set(&content_key(command), self.opts.dedup_ttl)
            .await?;
        Ok(!fresh)
    }

    fn full_name(&self, queue: &str) -> String {
        if queue.starts_with(&self.opts.prefix) {
            queue.to_string()
        } else {
            format!("{}{}", self.opts.prefix, queue)
        }
    }
}

/// Builds the failure-queue name: the failure suffix goes before any FIFO
/// suffix so the companion of a FIFO queue is itself FIFO.
fn failure_companion(name: &str, failure_suffix: &str, fifo_suffix: &str) -> String {
    match name.strip_suffix(fifo_suffix) {
        Some(base) => format!("{base}{failure_suffix}{fifo_suffix}"),
        None => format!("{name}{failure_suffix}"),
    }
}
