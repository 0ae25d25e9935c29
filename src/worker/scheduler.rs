//! The top-level polling scheduler.
//!
//! Owns the run loop: resolve the queue set, keep one poll task per
//! selected queue, aggregate statistics, and coordinate shutdown. A poll
//! task that finds its queue empty returns control until the next
//! resolution cycle, so a chronically busy queue is polled continuously
//! while a quiet one is revisited only periodically.
//!
//! Jobs run inline in their queue's poll task, one at a time per queue.
//! That keeps consecutive same-group messages on a FIFO queue strictly
//! sequential while different queues run concurrently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerOptions;
use crate::error::{ResolveError, WorkerError};
use crate::events::{EventSink, LifecycleEvent};
use crate::idle::IdleChecker;
use crate::queue::{Message, QueueClient, QueuePair};

use super::job::{JobOutcome, RunStats, StatsSnapshot};
use super::lease::LeaseManager;
use super::resolver::{QueueResolver, ResolveOptions};
use super::runner::{JobHandler, JobRunner, RunnerOptions};

/// How a received payload is executed.
#[derive(Clone)]
enum ExecMode {
    /// Run the payload as a shell command.
    Subprocess,
    /// Hand the payload to an injected handler.
    Callback(Arc<dyn JobHandler>),
}

/// Drives concurrent poll loops over the resolved queue set.
pub struct PollingScheduler {
    client: Arc<dyn QueueClient>,
    resolver: Arc<QueueResolver>,
    lease: Arc<LeaseManager>,
    runner: Arc<JobRunner>,
    events: Arc<EventSink>,
    stats: Arc<RunStats>,
    received: Arc<AtomicU64>,
    opts: WorkerOptions,
    cancel: CancellationToken,
}

impl PollingScheduler {
    /// Builds a scheduler and its collaborators around one queue client.
    pub fn new(
        client: Arc<dyn QueueClient>,
        opts: WorkerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let events = Arc::new(EventSink::new(opts.output));
        let idle = Arc::new(IdleChecker::new(client.clone()));
        let resolver = Arc::new(QueueResolver::new(
            client.clone(),
            idle,
            ResolveOptions {
                prefix: opts.prefix.clone(),
                suffixes: opts.suffixes.clone(),
                include_failed: opts.include_failed,
                fifo: opts.fifo,
                active_only: opts.active_only,
            },
        ));
        let lease = Arc::new(LeaseManager::new(
            client.clone(),
            events.clone(),
            opts.lease.clone(),
        ));
        let runner = Arc::new(JobRunner::new(
            RunnerOptions::new(opts.kill_after).with_nice(opts.nice),
        ));
        Self {
            client,
            resolver,
            lease,
            runner,
            events,
            stats: Arc::new(RunStats::new()),
            received: Arc::new(AtomicU64::new(0)),
            opts,
            cancel,
        }
    }

    /// Current run counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Worker mode: received payloads run as shell commands.
    ///
    /// With `drain` set the scheduler returns after the first full pass
    /// that processes nothing; otherwise it runs until the cancellation
    /// token fires, then drains in-flight work.
    pub async fn listen(&self, patterns: &[String]) -> Result<StatsSnapshot, WorkerError> {
        self.run(patterns, ExecMode::Subprocess).await
    }

    /// Library mode: received payloads are handed to `handler`.
    pub async fn process_messages(
        &self,
        patterns: &[String],
        handler: Arc<dyn JobHandler>,
    ) -> Result<StatsSnapshot, WorkerError> {
        self.run(patterns, ExecMode::Callback(handler)).await
    }

    async fn run(&self, patterns: &[String], mode: ExecMode) -> Result<StatsSnapshot, WorkerError> {
        let lease_task = self.lease.spawn(self.cancel.clone());
        let mut pollers: JoinSet<String> = JoinSet::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut run_error: Option<WorkerError> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let cycle_started = Instant::now();

            // Reap poll loops that returned control since the last cycle.
            while let Some(joined) = pollers.try_join_next() {
                match joined {
                    Ok(name) => {
                        active.remove(&name);
                    }
                    Err(e) => error!(error = %e, "Poll task failed to join"),
                }
            }

            let received_before = self.received.load(Ordering::SeqCst);
            let pairs = match self.resolver.resolve(patterns).await {
                Ok(pairs) => pairs,
                // Backend hiccups heal on a later cycle; pattern errors
                // cannot.
                Err(ResolveError::Queue(e)) => {
                    warn!(error = %e, "Queue resolution failed; retrying next cycle");
                    Vec::new()
                }
                Err(e) => {
                    run_error = Some(e.into());
                    break;
                }
            };
            debug!(queues = pairs.len(), "Resolution cycle");

            for pair in pairs {
                if active.contains(&pair.name) {
                    continue;
                }
                active.insert(pair.name.clone());
                self.spawn_poller(&mut pollers, pair, mode.clone());
            }

            if self.opts.drain {
                while let Some(joined) = pollers.join_next().await {
                    if let Err(e) = joined {
                        error!(error = %e, "Poll task failed to join");
                    }
                }
                active.clear();
                if self.received.load(Ordering::SeqCst) == received_before {
                    break;
                }
            } else {
                // Keep the resolution cadence stable regardless of how long
                // the cycle itself took.
                let remaining = self
                    .opts
                    .resolve_interval
                    .saturating_sub(cycle_started.elapsed());
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        // In-flight poll loops finish their current job and exit at the
        // next loop re-entry.
        while let Some(joined) = pollers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Poll task failed to join");
            }
        }

        // Final reconciliation: the lease loop runs until tracking is empty.
        self.lease.begin_drain();
        if lease_task.await.is_err() {
            error!("Lease maintenance task panicked");
        }
        if let Some(e) = run_error {
            return Err(e);
        }

        let snapshot = self.stats.snapshot();
        info!(
            jobs_succeeded = snapshot.jobs_succeeded,
            jobs_failed = snapshot.jobs_failed,
            no_jobs = snapshot.no_jobs,
            "Worker run finished"
        );
        Ok(snapshot)
    }

    fn spawn_poller(&self, pollers: &mut JoinSet<String>, pair: QueuePair, mode: ExecMode) {
        let worker = PollWorker {
            pair,
            client: self.client.clone(),
            resolver: self.resolver.clone(),
            lease: self.lease.clone(),
            runner: self.runner.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            received: self.received.clone(),
            wait_time: self.opts.wait_time,
            visibility_timeout_secs: self.opts.visibility_timeout_secs,
            mode,
            cancel: self.cancel.clone(),
        };
        pollers.spawn(async move {
            let name = worker.pair.name.clone();
            if AssertUnwindSafe(worker.run()).catch_unwind().await.is_err() {
                error!(queue = %name, "Poll loop panicked");
            }
            name
        });
    }
}

/// One queue's poll loop.
struct PollWorker {
    pair: QueuePair,
    client: Arc<dyn QueueClient>,
    resolver: Arc<QueueResolver>,
    lease: Arc<LeaseManager>,
    runner: Arc<JobRunner>,
    events: Arc<EventSink>,
    stats: Arc<RunStats>,
    received: Arc<AtomicU64>,
    wait_time: Duration,
    visibility_timeout_secs: u32,
    mode: ExecMode,
    cancel: CancellationToken,
}

impl PollWorker {
    /// Polls until the queue comes up empty, an error occurs, or shutdown
    /// is requested. A message already in hand is always processed.
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let messages = match self.client.receive(&self.pair, 1, self.wait_time).await {
                Ok(messages) => messages,
                Err(e) => {
                    // Isolated: this loop dies, siblings keep going, and the
                    // next resolution cycle may relaunch it.
                    error!(queue = %self.pair.name, error = %e, "Receive failed; poll loop exiting");
                    break;
                }
            };
            if messages.is_empty() {
                self.resolver.record_empty(&self.pair.name);
                self.stats.record_empty();
                break;
            }
            self.resolver.record_active(&self.pair.name);
            for message in messages {
                self.received.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.process(message).await {
                    error!(queue = %self.pair.name, error = %e, "Poll loop exiting after job error");
                    return;
                }
            }
            // No wait before the next receive: drain the backlog.
        }
    }

    async fn process(&self, message: Message) -> Result<(), WorkerError> {
        self.lease
            .register(&self.pair, &message, self.visibility_timeout_secs)?;
        self.lease.mark_running(&message.message_id)?;
        self.events.emit(&LifecycleEvent::processing_start(
            &self.pair.name,
            &message.message_id,
            &message.body,
        ));

        let started = Instant::now();
        let outcome = match &self.mode {
            ExecMode::Subprocess => self.runner.run_command(&message.body).await,
            ExecMode::Callback(handler) => {
                self.runner
                    .run_handler(handler.as_ref(), &self.pair.name, &message.body)
                    .await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            JobOutcome::Success { .. } => {
                self.lease.mark_complete(&message.message_id)?;
                self.stats.record_success();
                self.events.emit(&LifecycleEvent::processing_complete(
                    &self.pair.name,
                    &message.message_id,
                    duration_ms,
                ));
            }
            JobOutcome::Failure {
                exit_code,
                signal,
                stderr,
                error,
                ..
            } => {
                self.lease.mark_failed(&message.message_id)?;
                self.stats.record_failure();
                warn!(
                    queue = %self.pair.name,
                    message_id = %message.message_id,
                    ?exit_code,
                    ?signal,
                    error = ?error,
                    stderr = %stderr,
                    "Job failed; message left for redrive"
                );
                self.events.emit(&LifecycleEvent::processing_failed(
                    &self.pair.name,
                    &message.message_id,
                    exit_code,
                    signal,
                    duration_ms,
                ));
            }
            JobOutcome::Refused => {
                // Not processed: counts nowhere, message goes straight back.
                if let Err(e) = self.lease.release(&message.message_id).await {
                    warn!(
                        queue = %self.pair.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to release refused message"
                    );
                }
            }
        }
        Ok(())
    }
}
