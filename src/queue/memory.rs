//! In-memory queue backend.
//!
//! Implements the full [`QueueClient`] contract with real visibility
//! semantics: received messages move to an in-flight set with a
//! visible-at deadline and are redelivered once it passes. The test suite
//! runs the worker against this backend; call counters let tests assert
//! exactly which queue-side actions happened.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;

use super::{
    BatchFailure, BatchResult, DeleteEntry, Message, QueueClient, QueuePair, SendEntry,
    SendOptions, VisibilityEntry, ATTR_DELAYED, ATTR_NOT_VISIBLE, ATTR_VISIBILITY_TIMEOUT,
    ATTR_VISIBLE, BATCH_LIMIT,
};

/// How often a long-poll receive re-checks the queue.
const POLL_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    group_id: Option<String>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    default_visibility_secs: u32,
    attributes: HashMap<String, String>,
    ready: VecDeque<StoredMessage>,
    inflight: HashMap<String, InFlight>,
}

impl QueueState {
    /// Moves deliveries whose visibility deadline passed back to ready.
    fn promote_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for receipt in due {
            if let Some(flight) = self.inflight.remove(&receipt) {
                self.ready.push_back(flight.message);
            }
        }
    }

    /// Pops the next deliverable message. On FIFO queues a group with an
    /// in-flight delivery is skipped until that delivery is settled.
    fn pop_deliverable(&mut self, fifo: bool) -> Option<StoredMessage> {
        if !fifo {
            return self.ready.pop_front();
        }
        let blocked: HashSet<String> = self
            .inflight
            .values()
            .filter_map(|f| f.message.group_id.clone())
            .collect();
        let idx = self.ready.iter().position(|m| {
            m.group_id
                .as_ref()
                .map(|g| !blocked.contains(g))
                .unwrap_or(true)
        })?;
        self.ready.remove(idx)
    }
}

/// Counters of queue-side calls, for test assertions.
#[derive(Debug, Default)]
pub struct CallCounters {
    receives: AtomicU64,
    extend_calls: AtomicU64,
    extend_entries: AtomicU64,
    delete_calls: AtomicU64,
    delete_entries: AtomicU64,
}

impl CallCounters {
    pub fn receives(&self) -> u64 {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn extend_calls(&self) -> u64 {
        self.extend_calls.load(Ordering::SeqCst)
    }

    pub fn extend_entries(&self) -> u64 {
        self.extend_entries.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn delete_entries(&self) -> u64 {
        self.delete_entries.load(Ordering::SeqCst)
    }
}

/// Process-local queue backend.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<HashMap<String, QueueState>>,
    counters: CallCounters,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call counters for test assertions.
    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Number of ready (visible) messages on a queue.
    pub fn ready_len(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(name).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of in-flight deliveries on a queue.
    pub fn inflight_len(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(name).map(|q| q.inflight.len()).unwrap_or(0)
    }

    fn is_fifo_name(name: &str) -> bool {
        name.ends_with(".fifo")
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = state
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<String>, QueueError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.contains_key(name).then(|| name.to_string()))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let queue = state.entry(name.to_string()).or_default();
        queue.attributes.extend(
            attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if let Some(vt) = attributes.get(ATTR_VISIBILITY_TIMEOUT) {
            queue.default_visibility_secs = vt.parse().unwrap_or(30);
        } else if queue.default_visibility_secs == 0 {
            queue.default_visibility_secs = 30;
        }
        Ok(name.to_string())
    }

    async fn send(
        &self,
        queue: &QueuePair,
        body: &str,
        opts: &SendOptions,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let id = Uuid::new_v4().to_string();
        qs.ready.push_back(StoredMessage {
            id: id.clone(),
            body: body.to_string(),
            group_id: opts.group_id.clone(),
        });
        Ok(id)
    }

    async fn send_batch(
        &self,
        queue: &QueuePair,
        entries: &[SendEntry],
    ) -> Result<BatchResult, QueueError> {
        if entries.len() > BATCH_LIMIT {
            return Err(QueueError::BatchTooLarge(entries.len(), BATCH_LIMIT));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let mut result = BatchResult::default();
        for entry in entries {
            qs.ready.push_back(StoredMessage {
                id: Uuid::new_v4().to_string(),
                body: entry.body.clone(),
                group_id: entry.group_id.clone(),
            });
            result.successful.push(entry.id.clone());
        }
        Ok(result)
    }

    async fn receive(
        &self,
        queue: &QueuePair,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.counters.receives.fetch_add(1, Ordering::SeqCst);
        let fifo = Self::is_fifo_name(&queue.name);
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let qs = state
                    .get_mut(&queue.name)
                    .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
                let now = Instant::now();
                qs.promote_due(now);
                let visibility = Duration::from_secs(u64::from(qs.default_visibility_secs));
                let mut messages = Vec::new();
                while messages.len() < max {
                    let Some(stored) = qs.pop_deliverable(fifo) else {
                        break;
                    };
                    let receipt = Uuid::new_v4().to_string();
                    messages.push(Message {
                        message_id: stored.id.clone(),
                        receipt_handle: receipt.clone(),
                        body: stored.body.clone(),
                        group_id: stored.group_id.clone(),
                    });
                    qs.inflight.insert(
                        receipt,
                        InFlight {
                            message: stored,
                            visible_at: now + visibility,
                        },
                    );
                }
                if !messages.is_empty() {
                    return Ok(messages);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn change_visibility(
        &self,
        queue: &QueuePair,
        receipt_handle: &str,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let flight = qs
            .inflight
            .get_mut(receipt_handle)
            .ok_or_else(|| QueueError::ReceiptNotInFlight(receipt_handle.to_string()))?;
        flight.visible_at = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        queue: &QueuePair,
        entries: &[VisibilityEntry],
    ) -> Result<BatchResult, QueueError> {
        if entries.len() > BATCH_LIMIT {
            return Err(QueueError::BatchTooLarge(entries.len(), BATCH_LIMIT));
        }
        self.counters.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.counters
            .extend_entries
            .fetch_add(entries.len() as u64, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let now = Instant::now();
        let mut result = BatchResult::default();
        for entry in entries {
            match qs.inflight.get_mut(&entry.receipt_handle) {
                Some(flight) => {
                    flight.visible_at = now + Duration::from_secs(u64::from(entry.timeout_secs));
                    result.successful.push(entry.id.clone());
                }
                None => result.failed.push(BatchFailure {
                    id: entry.id.clone(),
                    reason: "receipt not in flight".to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn delete_batch(
        &self,
        queue: &QueuePair,
        entries: &[DeleteEntry],
    ) -> Result<BatchResult, QueueError> {
        if entries.len() > BATCH_LIMIT {
            return Err(QueueError::BatchTooLarge(entries.len(), BATCH_LIMIT));
        }
        self.counters.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.counters
            .delete_entries
            .fetch_add(entries.len() as u64, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get_mut(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let mut result = BatchResult::default();
        for entry in entries {
            if qs.inflight.remove(&entry.receipt_handle).is_some() {
                result.successful.push(entry.id.clone());
            } else {
                result.failed.push(BatchFailure {
                    id: entry.id.clone(),
                    reason: "receipt not in flight".to_string(),
                });
            }
        }
        Ok(result)
    }

    async fn get_attributes(
        &self,
        queue: &QueuePair,
        names: &[&str],
    ) -> Result<HashMap<String, String>, QueueError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let qs = state
            .get(&queue.name)
            .ok_or_else(|| QueueError::QueueNotFound(queue.name.clone()))?;
        let mut attrs = HashMap::new();
        for name in names {
            let value = match *name {
                ATTR_VISIBLE => qs.ready.len().to_string(),
                ATTR_NOT_VISIBLE => qs.inflight.len().to_string(),
                ATTR_DELAYED => "0".to_string(),
                ATTR_VISIBILITY_TIMEOUT => qs.default_visibility_secs.to_string(),
                other => match qs.attributes.get(other) {
                    Some(value) => value.clone(),
                    None => continue,
                },
            };
            attrs.insert((*name).to_string(), value);
        }
        Ok(attrs)
    }
}
