//! Queue name resolution.
//!
//! Expands user-supplied queue patterns (exact names or single-`*`
//! wildcards) into concrete `QueuePair`s, filtered by role and activity and
//! shuffled to avoid systematically starving queues later in the list.
//!
//! Chronically empty queues go to the "icehouse": a cool-down that grows
//! quadratically with the empty streak (jittered, clamped) and clears the
//! moment a poll finds a message. Cooling queues are left out of the
//! resolved set, which cuts polling pressure without starving them forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::RngExt;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::idle::IdleChecker;
use crate::queue::{QueueClient, QueuePair, QueueSuffixes};

/// Base seconds per squared empty streak.
const ICEHOUSE_BASE_SECS: f64 = 20.0;

/// Cool-down clamp bounds.
const ICEHOUSE_MIN_SECS: f64 = 10.0;
const ICEHOUSE_MAX_SECS: f64 = 600.0;

/// Options controlling resolution and filtering.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Namespace prepended to logical queue names.
    pub prefix: String,
    /// Suffix conventions for failure/dead-letter/FIFO roles.
    pub suffixes: QueueSuffixes,
    /// Keep failure- and dead-letter-suffixed queues.
    pub include_failed: bool,
    /// Keep only FIFO queues instead of only standard ones.
    pub fifo: bool,
    /// Keep only queues the idle checker reports non-idle.
    pub active_only: bool,
}

#[derive(Debug)]
struct IcehouseEntry {
    last_check: Instant,
    wait: Duration,
    empty_streak: u32,
}

/// Resolves queue patterns into concrete, filtered, ordered `QueuePair`s.
pub struct QueueResolver {
    client: Arc<dyn QueueClient>,
    idle: Arc<IdleChecker>,
    opts: ResolveOptions,
    icehouse: Mutex<HashMap<String, IcehouseEntry>>,
    rotation: Mutex<VecDeque<QueuePair>>,
}

impl QueueResolver {
    pub fn new(client: Arc<dyn QueueClient>, idle: Arc<IdleChecker>, opts: ResolveOptions) -> Self {
        Self {
            client,
            idle,
            opts,
            icehouse: Mutex::new(HashMap::new()),
            rotation: Mutex::new(VecDeque::new()),
        }
    }

    /// Resolves the patterns into the current queue set.
    ///
    /// Exact names are looked up directly; a wildcard pattern lists every
    /// queue sharing its prefix and keeps the names matching its suffix.
    /// Filters run in order: role, FIFO, icehouse, then (optionally)
    /// activity. The result order is randomized on every call.
    pub async fn resolve(&self, patterns: &[String]) -> Result<Vec<QueuePair>, ResolveError> {
        let mut pairs = Vec::new();
        let mut seen = HashSet::new();

        for pattern in patterns {
            let full = self.apply_prefix(pattern);
            match full.split_once('*') {
                Some((head, tail)) => {
                    if tail.contains('*') {
                        return Err(ResolveError::MultipleWildcards(pattern.clone()));
                    }
                    let matcher = suffix_matcher(pattern, tail)?;
                    for name in self.client.list_queues(head).await? {
                        if !matcher.is_match(&name) || !seen.insert(name.clone()) {
                            continue;
                        }
                        if let Some(locator) = self.client.get_queue(&name).await? {
                            pairs.push(QueuePair::new(name, locator));
                        }
                    }
                }
                None => {
                    if !seen.insert(full.clone()) {
                        continue;
                    }
                    match self.client.get_queue(&full).await? {
                        Some(locator) => pairs.push(QueuePair::new(full, locator)),
                        // Eventual consistency right after creation can
                        // hide a queue; it shows up next cycle.
                        None => debug!(queue = %full, "Queue not found, skipping this cycle"),
                    }
                }
            }
        }

        let suffixes = &self.opts.suffixes;
        if !self.opts.include_failed {
            pairs.retain(|p| !p.is_failure(suffixes) && !p.is_dead_letter(suffixes));
        }
        pairs.retain(|p| p.is_fifo(suffixes) == self.opts.fifo);
        pairs.retain(|p| !self.is_cooling(&p.name));

        if self.opts.active_only {
            let checks = join_all(
                pairs
                    .iter()
                    .map(|p| self.idle.cheap_check(&p.name, &p.locator)),
            )
            .await;
            let mut keep = checks.into_iter();
            pairs.retain(|pair| match keep.next() {
                Some(Ok(check)) => !check.idle,
                Some(Err(e)) => {
                    // Treat a failed check as busy rather than dropping a
                    // queue that may have work.
                    warn!(queue = %pair.name, error = %e, "Idle check failed");
                    true
                }
                None => true,
            });
        }

        let mut rng = rand::rng();
        pairs.shuffle(&mut rng);

        let mut rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        *rotation = pairs.iter().cloned().collect();

        Ok(pairs)
    }

    /// Fair rotation over the last resolved set: pops the first pair and
    /// re-appends it.
    pub fn next_pair(&self) -> Option<QueuePair> {
        let mut rotation = self.rotation.lock().unwrap_or_else(|e| e.into_inner());
        let pair = rotation.pop_front()?;
        rotation.push_back(pair.clone());
        Some(pair)
    }

    /// Records an empty poll result, growing the queue's cool-down.
    pub fn record_empty(&self, name: &str) {
        let mut icehouse = self.icehouse.lock().unwrap_or_else(|e| e.into_inner());
        let entry = icehouse.entry(name.to_string()).or_insert(IcehouseEntry {
            last_check: Instant::now(),
            wait: Duration::ZERO,
            empty_streak: 0,
        });
        entry.empty_streak += 1;
        let base = f64::from(entry.empty_streak).powi(2) * ICEHOUSE_BASE_SECS;
        let jitter = rand::rng().random_range(0.5..=1.5);
        let wait = (base * jitter).clamp(ICEHOUSE_MIN_SECS, ICEHOUSE_MAX_SECS);
        // An unlucky jitter draw must not shrink the cool-down mid-streak.
        entry.wait = entry.wait.max(Duration::from_secs_f64(wait));
        entry.last_check = Instant::now();
        debug!(
            queue = %name,
            streak = entry.empty_streak,
            wait_secs = entry.wait.as_secs(),
            "Queue iced"
        );
    }

    /// Records a non-empty poll result, clearing any cool-down.
    pub fn record_active(&self, name: &str) {
        let mut icehouse = self.icehouse.lock().unwrap_or_else(|e| e.into_inner());
        icehouse.remove(name);
    }

    fn is_cooling(&self, name: &str) -> bool {
        let icehouse = self.icehouse.lock().unwrap_or_else(|e| e.into_inner());
        icehouse
            .get(name)
            .map(|entry| entry.last_check.elapsed() < entry.wait)
            .unwrap_or(false)
    }

    fn apply_prefix(&self, pattern: &str) -> String {
        if pattern.starts_with(&self.opts.prefix) {
            pattern.to_string()
        } else {
            format!("{}{}", self.opts.prefix, pattern)
        }
    }

    #[cfg(test)]
    fn icehouse_wait(&self, name: &str) -> Option<Duration> {
        let icehouse = self.icehouse.lock().unwrap_or_else(|e| e.into_inner());
        icehouse.get(name).map(|entry| entry.wait)
    }
}

/// Builds the end-anchored matcher for a wildcard suffix.
///
/// Characters outside `[A-Za-z0-9_.]` are stripped first so a stray shell
/// glob or typo cannot produce a malformed match.
fn suffix_matcher(pattern: &str, tail: &str) -> Result<Regex, ResolveError> {
    let sanitized: String = tail
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    Regex::new(&format!("{}$", regex::escape(&sanitized))).map_err(|e| {
        ResolveError::BadPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::SendOptions;
    use std::collections::HashMap as StdHashMap;

    async fn client_with(names: &[&str]) -> Arc<InMemoryQueue> {
        let client = Arc::new(InMemoryQueue::new());
        for name in names {
            client
                .create_queue(name, &StdHashMap::new())
                .await
                .unwrap();
        }
        client
    }

    fn resolver(client: Arc<InMemoryQueue>, opts: ResolveOptions) -> QueueResolver {
        let idle = Arc::new(IdleChecker::new(client.clone()));
        QueueResolver::new(client, idle, opts)
    }

    fn default_opts() -> ResolveOptions {
        ResolveOptions {
            prefix: "qrelay_".to_string(),
            suffixes: QueueSuffixes::default(),
            include_failed: false,
            fifo: false,
            active_only: false,
        }
    }

    fn names(pairs: &[QueuePair]) -> HashSet<String> {
        pairs.iter().map(|p| p.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_wildcard_excludes_failure_queues() {
        let client = client_with(&[
            "qrelay_test1",
            "qrelay_test2",
            "qrelay_test3",
            "qrelay_test2_failed",
            "qrelay_other",
        ])
        .await;
        let resolver = resolver(client, default_opts());

        let pairs = resolver.resolve(&["test*".to_string()]).await.unwrap();
        assert_eq!(
            names(&pairs),
            HashSet::from([
                "qrelay_test1".to_string(),
                "qrelay_test2".to_string(),
                "qrelay_test3".to_string(),
            ])
        );
    }

    #[tokio::test]
    async fn test_include_failed_keeps_failure_queues() {
        let client = client_with(&["qrelay_test1", "qrelay_test1_failed"]).await;
        let mut opts = default_opts();
        opts.include_failed = true;
        let resolver = resolver(client, opts);

        let pairs = resolver.resolve(&["test*".to_string()]).await.unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_suffix_is_end_anchored() {
        let client = client_with(&["qrelay_a_jobs", "qrelay_b_jobs", "qrelay_jobs_b"]).await;
        let resolver = resolver(client, default_opts());

        let pairs = resolver.resolve(&["*jobs".to_string()]).await.unwrap();
        assert_eq!(
            names(&pairs),
            HashSet::from(["qrelay_a_jobs".to_string(), "qrelay_b_jobs".to_string()])
        );
    }

    #[tokio::test]
    async fn test_wildcard_suffix_is_sanitized() {
        let client = client_with(&["qrelay_test1"]).await;
        let resolver = resolver(client, default_opts());

        // The stray characters are stripped before matching.
        let pairs = resolver.resolve(&["test*1$(!)".to_string()]).await.unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_wildcards_rejected() {
        let client = client_with(&[]).await;
        let resolver = resolver(client, default_opts());
        let err = resolver
            .resolve(&["a*b*".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MultipleWildcards(_)));
    }

    #[tokio::test]
    async fn test_exact_name_resolution() {
        let client = client_with(&["qrelay_exact"]).await;
        let resolver = resolver(client, default_opts());

        let pairs = resolver.resolve(&["exact".to_string()]).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].name, "qrelay_exact");

        // A missing exact name is skipped, not an error.
        let pairs = resolver.resolve(&["missing".to_string()]).await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_filter() {
        let client = client_with(&["qrelay_jobs", "qrelay_jobs.fifo"]).await;

        let standard = resolver(client.clone(), default_opts());
        let pairs = standard.resolve(&["jobs*".to_string()]).await.unwrap();
        assert_eq!(names(&pairs), HashSet::from(["qrelay_jobs".to_string()]));

        let mut opts = default_opts();
        opts.fifo = true;
        let fifo = resolver(client, opts);
        let pairs = fifo.resolve(&["jobs*".to_string()]).await.unwrap();
        assert_eq!(
            names(&pairs),
            HashSet::from(["qrelay_jobs.fifo".to_string()])
        );
    }

    #[tokio::test]
    async fn test_active_only_drops_idle_queues() {
        let client = client_with(&["qrelay_busy", "qrelay_quiet"]).await;
        let busy = QueuePair::new("qrelay_busy", "qrelay_busy");
        client
            .send(&busy, "true", &SendOptions::default())
            .await
            .unwrap();

        let mut opts = default_opts();
        opts.active_only = true;
        let resolver = resolver(client, opts);

        let pairs = resolver.resolve(&["*".to_string()]).await.unwrap();
        assert_eq!(names(&pairs), HashSet::from(["qrelay_busy".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_icehouse_excludes_and_releases() {
        let client = client_with(&["qrelay_cold"]).await;
        let resolver = resolver(client, default_opts());

        resolver.record_empty("qrelay_cold");
        let pairs = resolver.resolve(&["cold".to_string()]).await.unwrap();
        assert!(pairs.is_empty(), "cooling queue must be excluded");

        // The clamp guarantees eligibility after the maximum cool-down.
        tokio::time::sleep(Duration::from_secs(601)).await;
        let pairs = resolver.resolve(&["cold".to_string()]).await.unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[tokio::test]
    async fn test_icehouse_wait_grows_with_streak_and_clears() {
        let client = client_with(&["qrelay_cold"]).await;
        let resolver = resolver(client, default_opts());

        resolver.record_empty("qrelay_cold");
        let first = resolver.icehouse_wait("qrelay_cold").unwrap();
        // streak 1: 20s jittered by ±50%, clamped to [10, 600]
        assert!(first >= Duration::from_secs(10));
        assert!(first <= Duration::from_secs(30));

        resolver.record_empty("qrelay_cold");
        let second = resolver.icehouse_wait("qrelay_cold").unwrap();
        // streak 2: 80s jittered by ±50%
        assert!(second >= Duration::from_secs(40));
        assert!(second <= Duration::from_secs(120));
        assert!(second > first);

        resolver.record_active("qrelay_cold");
        assert!(resolver.icehouse_wait("qrelay_cold").is_none());
    }

    #[tokio::test]
    async fn test_next_pair_rotates_fairly() {
        let client = client_with(&["qrelay_a", "qrelay_b"]).await;
        let resolver = resolver(client, default_opts());
        resolver.resolve(&["*".to_string()]).await.unwrap();

        let first = resolver.next_pair().unwrap();
        let second = resolver.next_pair().unwrap();
        let third = resolver.next_pair().unwrap();
        assert_ne!(first.name, second.name);
        assert_eq!(first.name, third.name);
    }
}
