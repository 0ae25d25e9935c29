//! Configuration structs for the worker and enqueue paths.
//!
//! All options are populated once from the CLI (or library caller) into
//! explicit structs; the core never re-derives option names at runtime.

use std::time::Duration;

use crate::events::OutputMode;
use crate::queue::QueueSuffixes;

/// Default long-poll wait for a single receive call.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(20);

/// Default initial visibility timeout for received messages.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 30;

/// Default hard kill deadline for a running job.
pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(270);

/// Default interval between queue re-resolution cycles.
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for the worker run loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Long-poll wait per receive call.
    pub wait_time: Duration,
    /// Initial visibility timeout assumed for received messages.
    pub visibility_timeout_secs: u32,
    /// Hard deadline after which a running job is killed.
    pub kill_after: Duration,
    /// Interval between queue re-resolution cycles.
    pub resolve_interval: Duration,
    /// Niceness applied to job subprocesses; `None` runs them unniced.
    pub nice: Option<i32>,
    /// Poll failure-suffixed queues too.
    pub include_failed: bool,
    /// Only poll queues reporting in-flight/visible/delayed messages.
    pub active_only: bool,
    /// Poll FIFO-suffixed queues instead of standard ones.
    pub fifo: bool,
    /// Keep passing over the queues until a full pass finds them all empty,
    /// then return, instead of running until shutdown.
    pub drain: bool,
    /// Namespace prepended to logical queue names.
    pub prefix: String,
    /// Suffix conventions for failure/dead-letter/FIFO roles.
    pub suffixes: QueueSuffixes,
    /// Lifecycle event output mode.
    pub output: OutputMode,
    /// Lease maintenance cadence.
    pub lease: LeaseOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            wait_time: DEFAULT_WAIT_TIME,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            kill_after: DEFAULT_KILL_AFTER,
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
            nice: Some(10),
            include_failed: false,
            active_only: false,
            fifo: false,
            drain: false,
            prefix: "qrelay_".to_string(),
            suffixes: QueueSuffixes::default(),
            output: OutputMode::Default,
            lease: LeaseOptions::default(),
        }
    }
}

impl WorkerOptions {
    /// Sets the long-poll wait per receive call.
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    /// Sets the initial visibility timeout.
    pub fn with_visibility_timeout_secs(mut self, secs: u32) -> Self {
        self.visibility_timeout_secs = secs;
        self
    }

    /// Sets the hard kill deadline.
    pub fn with_kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = kill_after;
        self
    }

    /// Sets the resolution cycle interval.
    pub fn with_resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval = interval;
        self
    }

    /// Sets the subprocess niceness.
    pub fn with_nice(mut self, nice: Option<i32>) -> Self {
        self.nice = nice;
        self
    }

    /// Includes failure-suffixed queues in resolution.
    pub fn with_include_failed(mut self, include: bool) -> Self {
        self.include_failed = include;
        self
    }

    /// Restricts polling to queues with visible/in-flight/delayed messages.
    pub fn with_active_only(mut self, active_only: bool) -> Self {
        self.active_only = active_only;
        self
    }

    /// Polls FIFO-suffixed queues instead of standard ones.
    pub fn with_fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }

    /// Drain mode: return once a full pass finds every queue empty.
    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    /// Sets the queue name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the lifecycle event output mode.
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Sets the lease maintenance cadence.
    pub fn with_lease(mut self, lease: LeaseOptions) -> Self {
        self.lease = lease;
        self
    }
}

/// Cadence for the visibility lease maintenance loop.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// Tick interval while the worker is active.
    pub tick: Duration,
    /// Tick interval while draining at shutdown.
    pub drain_tick: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            drain_tick: Duration::from_secs(1),
        }
    }
}

impl LeaseOptions {
    /// Sets the active tick interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Sets the drain tick interval.
    pub fn with_drain_tick(mut self, tick: Duration) -> Self {
        self.drain_tick = tick;
        self
    }
}

/// Configuration for the enqueue path.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Namespace prepended to logical queue names.
    pub prefix: String,
    /// Suffix conventions for failure/dead-letter/FIFO roles.
    pub suffixes: QueueSuffixes,
    /// Message group id for FIFO queues.
    pub group_id: Option<String>,
    /// Skip commands whose content hash was enqueued within the dedup TTL.
    pub dedup: bool,
    /// How long a content hash suppresses duplicates.
    pub dedup_ttl: Duration,
    /// Receive count after which the queue service redrives a message to
    /// the failure queue.
    pub max_receive_count: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            prefix: "qrelay_".to_string(),
            suffixes: QueueSuffixes::default(),
            group_id: None,
            dedup: false,
            dedup_ttl: Duration::from_secs(6 * 60 * 60),
            max_receive_count: 3,
        }
    }
}

impl EnqueueOptions {
    /// Sets the queue name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the FIFO message group id.
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Enables content-hash deduplication.
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    /// Sets the dedup suppression TTL.
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Sets the redrive max receive count.
    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }
}
