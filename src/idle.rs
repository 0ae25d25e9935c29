//! Cheap idle-queue detection.
//!
//! One attribute call per queue answers "is there anything to do here?";
//! results are cached briefly so active-only resolution doesn't hammer the
//! queue service every cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::queue::{QueueClient, QueuePair, ATTR_DELAYED, ATTR_NOT_VISIBLE, ATTR_VISIBLE};

/// How long a check result stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Result of a cheap idle check.
#[derive(Debug, Clone)]
pub struct IdleCheck {
    /// No visible, in-flight or delayed messages.
    pub idle: bool,
    /// The raw attributes backing the verdict.
    pub attributes: HashMap<String, String>,
}

#[derive(Clone)]
struct CachedCheck {
    check: IdleCheck,
    fetched_at: Instant,
}

/// Checks queues for pending work, with a short per-queue cache.
pub struct IdleChecker {
    client: Arc<dyn QueueClient>,
    cache: Mutex<HashMap<String, CachedCheck>>,
}

impl IdleChecker {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Reports whether a queue currently has any messages at all.
    pub async fn cheap_check(&self, name: &str, locator: &str) -> Result<IdleCheck, QueueError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(name) {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.check.clone());
                }
            }
        }

        let pair = QueuePair::new(name, locator);
        let attributes = self
            .client
            .get_attributes(&pair, &[ATTR_VISIBLE, ATTR_NOT_VISIBLE, ATTR_DELAYED])
            .await?;
        let idle = [ATTR_VISIBLE, ATTR_NOT_VISIBLE, ATTR_DELAYED]
            .iter()
            .all(|attr| {
                attributes
                    .get(*attr)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    == 0
            });
        debug!(queue = %name, idle, "Idle check");

        let check = IdleCheck { idle, attributes };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            name.to_string(),
            CachedCheck {
                check: check.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(check)
    }
}
