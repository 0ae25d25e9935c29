//! Redis-backed queue backend.
//!
//! Implements the [`QueueClient`] contract over Redis with visibility
//! semantics:
//!
//! - `{ns}:queues`: registry set of queue names
//! - `{ns}:queue:{name}:ready`: list of deliverable messages
//! - `{ns}:queue:{name}:inflight`: zset of receipt handle -> visible-at
//!   (epoch milliseconds)
//! - `{ns}:queue:{name}:messages`: hash of receipt handle -> message body
//! - `{ns}:queue:{name}:attrs`: hash of queue attributes
//!
//! A receive first promotes in-flight deliveries whose visible-at passed
//! back onto the ready list, then blocks on the list in one-second slices
//! so promotion keeps happening for the whole long-poll window.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;

use super::{
    BatchFailure, BatchResult, DeleteEntry, Message, QueueClient, QueuePair, SendEntry,
    SendOptions, VisibilityEntry, ATTR_DELAYED, ATTR_NOT_VISIBLE, ATTR_VISIBILITY_TIMEOUT,
    ATTR_VISIBLE, BATCH_LIMIT,
};

/// Longest single block on the ready list; bounds promotion latency.
const BLOCK_SLICE_SECS: u64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    body: String,
    #[serde(default)]
    group_id: Option<String>,
}

/// Redis-backed queue service.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisQueue {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Creates a queue service from an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            namespace: "qrelay".to_string(),
        }
    }

    /// Overrides the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn registry_key(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    fn ready_key(&self, name: &str) -> String {
        format!("{}:queue:{}:ready", self.namespace, name)
    }

    fn inflight_key(&self, name: &str) -> String {
        format!("{}:queue:{}:inflight", self.namespace, name)
    }

    fn messages_key(&self, name: &str) -> String {
        format!("{}:queue:{}:messages", self.namespace, name)
    }

    fn attrs_key(&self, name: &str) -> String {
        format!("{}:queue:{}:attrs", self.namespace, name)
    }

    fn locator(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    async fn assert_exists(&self, name: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let known: bool = conn.sismember(self.registry_key(), name).await?;
        if known {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(name.to_string()))
        }
    }

    async fn default_visibility_secs(&self, name: &str) -> Result<u32, QueueError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .hget(self.attrs_key(name), ATTR_VISIBILITY_TIMEOUT)
            .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(30))
    }

    /// Moves due in-flight deliveries back to the ready list.
    async fn promote_due(&self, name: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(self.inflight_key(name), "-inf", now_ms)
            .await?;
        for receipt in due {
            let payload: Option<String> = conn.hget(self.messages_key(name), &receipt).await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .zrem(self.inflight_key(name), &receipt)
                .hdel(self.messages_key(name), &receipt);
            if let Some(payload) = payload {
                pipe.rpush(self.ready_key(name), payload);
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(())
    }

    async fn check_in(
        &self,
        name: &str,
        payload: &str,
        visibility_secs: u32,
    ) -> Result<Message, QueueError> {
        let stored: StoredMessage = serde_json::from_str(payload)?;
        let receipt = Uuid::new_v4().to_string();
        let visible_at = Utc::now().timestamp_millis() + i64::from(visibility_secs) * 1000;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zadd(self.inflight_key(name), &receipt, visible_at)
            .hset(self.messages_key(name), &receipt, payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(Message {
            message_id: stored.id,
            receipt_handle: receipt,
            body: stored.body,
            group_id: stored.group_id,
        })
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn list_queues(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = conn.smembers(self.registry_key()).await?;
        let mut names: Vec<String> = names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let known: bool = conn.sismember(self.registry_key(), name).await?;
        Ok(known.then(|| self.locator(name)))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(self.registry_key(), name);
        for (key, value) in attributes {
            pipe.hset(self.attrs_key(name), key, value);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(self.locator(name))
    }

    async fn send(
        &self,
        queue: &QueuePair,
        body: &str,
        opts: &SendOptions,
    ) -> Result<String, QueueError> {
        self.assert_exists(&queue.name).await?;
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            group_id: opts.group_id.clone(),
        };
        let payload = serde_json::to_string(&stored)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.ready_key(&queue.name), payload)
            .await?;
        Ok(stored.id)
    }

    async fn send_batch(
        &self,
        queue: &QueuePair,
        entries: &[SendEntry],
    ) -> Result<BatchResult, QueueError> {
        if entries.len() > BATCH_LIMIT {
            return Err(QueueError::BatchTooLarge(entries.len(), BATCH_LIMIT));
        }
        self.assert_exists(&queue.name).await?;
        let mut result = BatchResult::default();
        let mut pipe = redis::pipe();
        for entry in entries {
            let stored = StoredMessage {
                id: Uuid::new_v4().to_string(),
                body: entry.body.clone(),
                group_id: entry.group_id.clone(),
            };
            let payload = serde_json::to_string(&stored)?;
            pipe.lpush(self.ready_key(&queue.name), payload);
            result.successful.push(entry.id.clone());
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(result)
    }

    async fn receive(
        &self,
        queue: &QueuePair,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        self.assert_exists(&queue.name).await?;
        let visibility = self.default_visibility_secs(&queue.name).await?;
        let deadline = Instant::now() + wait;
        let ready_key = self.ready_key(&queue.name);
        loop {
            self.promote_due(&queue.name).await?;

            let mut conn = self.conn.clone();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let block_secs = remaining.as_secs().clamp(0, BLOCK_SLICE_SECS);
            let popped: Option<(String, String)> = if block_secs == 0 {
                conn.rpop::<_, Option<String>>(&ready_key, None)
                    .await?
                    .map(|payload| (ready_key.clone(), payload))
            } else {
                redis::cmd("BRPOP")
                    .arg(&ready_key)
                    .arg(block_secs)
                    .query_async(&mut conn)
                    .await?
            };

            if let Some((_, payload)) = popped {
                let mut messages = vec![self.check_in(&queue.name, &payload, visibility).await?];
                while messages.len() < max {
                    let extra: Option<String> = conn.rpop(&ready_key, None).await?;
                    match extra {
                        Some(payload) => {
                            messages.push(self.check_in(&queue.name, &payload, visibility).await?)
                        }
                        None => break,
                    }
                }
                return Ok(messages);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            if block_secs == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    async fn change_visibility(
        &self,
        queue: &QueuePair,
        receipt_handle: &str,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn
            .zscore(self.inflight_key(&queue.name), receipt_handle)
            .await?;
        if score.is_none() {
            return Err(QueueError::ReceiptNotInFlight(receipt_handle.to_string()));
        }
        let visible_at = Utc::now().timestamp_millis() + i64::from(timeout_secs) * 1000;
        conn.zadd::<_, _, _, ()>(self.inflight_key(&queue.name), receipt_handle, visible_at)
            .await?;
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
        let mut result = BatchResult::default();
        for entry in entries {
            match self
                .change_visibility(queue, &entry.receipt_handle, entry.timeout_secs)
                .await
            {
                Ok(()) => result.successful.push(entry.id.clone()),
                Err(QueueError::ReceiptNotInFlight(_)) => result.failed.push(BatchFailure {
                    id: entry.id.clone(),
                    reason: "receipt not in flight".to_string(),
                }),
                Err(other) => return Err(other),
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
        let mut conn = self.conn.clone();
        let mut result = BatchResult::default();
        for entry in entries {
            let removed: i64 = conn
                .zrem(self.inflight_key(&queue.name), &entry.receipt_handle)
                .await?;
            conn.hdel::<_, _, ()>(self.messages_key(&queue.name), &entry.receipt_handle)
                .await?;
            if removed == 1 {
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
        self.assert_exists(&queue.name).await?;
        let mut conn = self.conn.clone();
        let mut attrs = HashMap::new();
        for name in names {
            let value = match *name {
                ATTR_VISIBLE => {
                    let len: i64 = conn.llen(self.ready_key(&queue.name)).await?;
                    len.to_string()
                }
                ATTR_NOT_VISIBLE => {
                    let len: i64 = conn.zcard(self.inflight_key(&queue.name)).await?;
                    len.to_string()
                }
                ATTR_DELAYED => "0".to_string(),
                other => {
                    let stored: Option<String> =
                        conn.hget(self.attrs_key(&queue.name), other).await?;
                    match stored {
                        Some(v) => v,
                        None => continue,
                    }
                }
            };
            attrs.insert((*name).to_string(), value);
        }
        Ok(attrs)
    }
}
