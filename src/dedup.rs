//! Content-hash deduplication for the enqueue path.
//!
//! A command's SHA-256 digest is set-if-absent with a TTL; when the set
//! fails the same command was enqueued recently and is skipped. The same
//! protocol applies to standard and FIFO queues.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::QueueError;

/// SHA-256 digest of a command payload, hex-encoded.
pub fn content_key(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    format!("{digest:x}")
}

/// A set-if-absent cache with expiry.
#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Returns `true` if `key` was absent and is now held for `ttl`;
    /// `false` if it was already present.
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, QueueError>;
}

/// Redis-backed dedup cache (`SET NX EX`).
pub struct RedisDedupCache {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisDedupCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            namespace: "qrelay:dedup".to_string(),
        }
    }
}

#[async_trait]
impl DedupCache for RedisDedupCache {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(format!("{}:{}", self.namespace, key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }
}

/// Process-local dedup cache, for tests and embedded use.
#[derive(Default)]
pub struct InMemoryDedupCache {
    seen: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        seen.retain(|_, expires_at| *expires_at > now);
        if seen.contains_key(key) {
            return Ok(false);
        }
        seen.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_is_stable_and_distinct() {
        assert_eq!(content_key("true"), content_key("true"));
        assert_ne!(content_key("true"), content_key("false"));
        assert_eq!(content_key("true").len(), 64);
    }

    #[tokio::test]
    async fn test_memory_cache_suppresses_within_ttl() {
        let cache = InMemoryDedupCache::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.check_and_set("k", ttl).await.unwrap());
        assert!(!cache.check_and_set("k", ttl).await.unwrap());
        assert!(cache.check_and_set("other", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_expires() {
        let cache = InMemoryDedupCache::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.check_and_set("k", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.check_and_set("k", ttl).await.unwrap());
    }
}
