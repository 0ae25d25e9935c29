//! Visibility lease maintenance.
//!
//! Tracks one lease per in-flight job and keeps the queue-side visibility
//! timeout ahead of actual job runtime with the fewest possible batched
//! calls. A maintenance tick (10s active, 1s while draining) partitions
//! tracked jobs: completed jobs are deleted in batches, failed jobs are
//! dropped and left to the queue's redrive policy, and everything else is
//! extended once its runtime crosses the extension threshold.
//!
//! The job registry is owned exclusively by this manager; the lock is never
//! held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaseOptions;
use crate::error::WorkerError;
use crate::events::{EventSink, LifecycleEvent};
use crate::queue::{
    DeleteEntry, Message, QueueClient, QueuePair, VisibilityEntry, BATCH_LIMIT,
};

use super::job::{Job, JobStatus};

/// Hard ceiling on total lease duration, independent of configuration.
/// Bounds the worst case regardless of misconfiguration.
pub const MAX_JOB_RUN_SECS: u64 = 12 * 60 * 60;

/// Sizes the next extension for a job.
///
/// The new visibility timeout doubles the current one, capped so the lease
/// never outlives [`MAX_JOB_RUN_SECS`]; the next threshold sits at the
/// midpoint of the new window so renewal happens proactively. Returns
/// `None` once the ceiling is reached.
fn next_extension(current_timeout_secs: u32, elapsed_secs: u64) -> Option<(u32, u64)> {
    let remaining = MAX_JOB_RUN_SECS.saturating_sub(elapsed_secs);
    if remaining == 0 {
        return None;
    }
    let doubled = u64::from(current_timeout_secs).saturating_mul(2);
    let new_timeout = doubled.min(remaining);
    let extend_at = elapsed_secs + new_timeout / 2;
    Some((new_timeout as u32, extend_at))
}

#[derive(Default)]
struct LeaseState {
    jobs: HashMap<String, Job>,
    draining: bool,
}

struct ExtendPlan {
    entry: VisibilityEntry,
    prev_timeout_secs: u32,
    prev_extend_at_secs: u64,
}

/// Tracks visibility leases for all in-flight jobs.
pub struct LeaseManager {
    client: Arc<dyn QueueClient>,
    events: Arc<EventSink>,
    opts: LeaseOptions,
    state: Mutex<LeaseState>,
    kick: Notify,
}

impl LeaseManager {
    pub fn new(client: Arc<dyn QueueClient>, events: Arc<EventSink>, opts: LeaseOptions) -> Self {
        Self {
            client,
            events,
            opts,
            state: Mutex::new(LeaseState::default()),
            kick: Notify::new(),
        }
    }

    /// Starts tracking a received message.
    ///
    /// Seeing a message identifier that is already tracked means the
    /// extension loop fell behind and the queue redelivered; that is fatal
    /// for the job and reported loudly, never absorbed.
    pub fn register(
        &self,
        queue: &QueuePair,
        message: &Message,
        visibility_timeout_secs: u32,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.jobs.get(&message.message_id) {
            let running_for_secs = existing.elapsed_secs();
            error!(
                message_id = %message.message_id,
                queue = %existing.queue.name,
                running_for_secs,
                status = %existing.status,
                "Duplicate receipt of a tracked message; lease extension fell behind"
            );
            return Err(WorkerError::DuplicateReceipt {
                message_id: message.message_id.clone(),
                queue: existing.queue.name.clone(),
                running_for_secs,
            });
        }
        state.jobs.insert(
            message.message_id.clone(),
            Job {
                message_id: message.message_id.clone(),
                receipt_handle: message.receipt_handle.clone(),
                queue: queue.clone(),
                payload: message.body.clone(),
                group_id: message.group_id.clone(),
                started_at: tokio::time::Instant::now(),
                visibility_timeout_secs,
                extend_at_secs: u64::from(visibility_timeout_secs) / 2,
                status: JobStatus::Waiting,
            },
        );
        Ok(())
    }

    /// Marks a tracked job as executing.
    pub fn mark_running(&self, message_id: &str) -> Result<(), WorkerError> {
        self.set_status(message_id, JobStatus::Running)
    }

    /// Marks a tracked job complete; the next tick deletes it.
    pub fn mark_complete(&self, message_id: &str) -> Result<(), WorkerError> {
        self.set_status(message_id, JobStatus::Complete)
    }

    /// Marks a tracked job failed; the next tick drops it, leaving the
    /// message to expire and be retried or redriven by the queue service.
    pub fn mark_failed(&self, message_id: &str) -> Result<(), WorkerError> {
        self.set_status(message_id, JobStatus::Failed)
    }

    /// Stops tracking a refused job and returns its message to immediate
    /// visibility so another consumer can pick it up sooner.
    pub async fn release(&self, message_id: &str) -> Result<(), WorkerError> {
        let job = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .jobs
                .remove(message_id)
                .ok_or_else(|| WorkerError::UnknownJob(message_id.to_string()))?
        };
        self.client
            .change_visibility(&job.queue, &job.receipt_handle, 0)
            .await?;
        Ok(())
    }

    /// Number of jobs currently tracked.
    pub fn tracked(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.jobs.len()
    }

    /// Switches the manager to drain mode: the next tick runs immediately
    /// and subsequent ticks use the drain cadence until tracking is empty.
    /// Idempotent.
    pub fn begin_drain(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.draining = true;
        }
        self.kick.notify_one();
    }

    fn is_draining(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.draining
    }

    fn set_status(&self, message_id: &str, status: JobStatus) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let job = state
            .jobs
            .get_mut(message_id)
            .ok_or_else(|| WorkerError::UnknownJob(message_id.to_string()))?;
        job.status = status;
        Ok(())
    }

    /// Runs the maintenance loop until cancelled and fully drained.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let draining = manager.is_draining();
                let tick = if draining {
                    manager.opts.drain_tick
                } else {
                    manager.opts.tick
                };
                if draining {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => {}
                        _ = manager.kick.notified() => {}
                    }
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => {}
                        _ = manager.kick.notified() => {}
                        _ = cancel.cancelled() => {
                            manager.begin_drain();
                        }
                    }
                }
                manager.tick().await;
                if manager.is_draining() && manager.tracked() == 0 {
                    break;
                }
            }
            info!("Lease maintenance drained");
        })
    }

    /// One maintenance pass: plan under the lock, call the queue service
    /// without it, then reconcile.
    async fn tick(&self) {
        let mut extends: HashMap<QueuePair, Vec<ExtendPlan>> = HashMap::new();
        let mut deletes: HashMap<QueuePair, Vec<DeleteEntry>> = HashMap::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.jobs.retain(|message_id, job| {
                if job.status == JobStatus::Failed {
                    debug!(message_id = %message_id, queue = %job.queue.name,
                        "Dropping failed job; message left for redrive");
                    return false;
                }
                true
            });
            for job in state.jobs.values_mut() {
                match job.status {
                    JobStatus::Complete => {
                        job.status = JobStatus::Deleting;
                        deletes
                            .entry(job.queue.clone())
                            .or_default()
                            .push(DeleteEntry {
                                id: job.message_id.clone(),
                                receipt_handle: job.receipt_handle.clone(),
                            });
                    }
                    JobStatus::Waiting | JobStatus::Running => {
                        let elapsed = job.elapsed_secs();
                        if elapsed < job.extend_at_secs {
                            continue;
                        }
                        if let Some((new_timeout, extend_at)) =
                            next_extension(job.visibility_timeout_secs, elapsed)
                        {
                            let plan = ExtendPlan {
                                entry: VisibilityEntry {
                                    id: job.message_id.clone(),
                                    receipt_handle: job.receipt_handle.clone(),
                                    timeout_secs: new_timeout,
                                },
                                prev_timeout_secs: job.visibility_timeout_secs,
                                prev_extend_at_secs: job.extend_at_secs,
                            };
                            job.visibility_timeout_secs = new_timeout;
                            job.extend_at_secs = extend_at;
                            extends.entry(job.queue.clone()).or_default().push(plan);
                        }
                    }
                    JobStatus::Deleting | JobStatus::Refused | JobStatus::Failed => {}
                }
            }
        }

        for (queue, plans) in extends {
            self.extend_queue(&queue, plans).await;
        }
        for (queue, entries) in deletes {
            self.delete_queue(&queue, entries).await;
        }

        // Anything that reached deleting this cycle leaves tracking now;
        // a delete the service rejected is logged above and accepted as
        // the at-least-once trade-off.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .jobs
            .retain(|_, job| job.status != JobStatus::Deleting);
    }

    async fn extend_queue(&self, queue: &QueuePair, plans: Vec<ExtendPlan>) {
        for chunk in plans.chunks(BATCH_LIMIT) {
            let entries: Vec<VisibilityEntry> = chunk.iter().map(|p| p.entry.clone()).collect();
            match self.client.change_visibility_batch(queue, &entries).await {
                Ok(result) => {
                    self.events.emit(&LifecycleEvent::extend_visibility_timeouts(
                        &queue.name,
                        result.successful.len(),
                        result.failed.len(),
                    ));
                    for failure in &result.failed {
                        warn!(
                            message_id = %failure.id,
                            queue = %queue.name,
                            reason = %failure.reason,
                            "Failed to extend visibility; will retry next tick"
                        );
                    }
                    let failed_ids: Vec<&str> =
                        result.failed.iter().map(|f| f.id.as_str()).collect();
                    self.revert_plans(chunk, &failed_ids);
                }
                Err(e) => {
                    warn!(queue = %queue.name, error = %e,
                        "Visibility extension batch failed; will retry next tick");
                    let all_ids: Vec<&str> =
                        chunk.iter().map(|p| p.entry.id.as_str()).collect();
                    self.revert_plans(chunk, &all_ids);
                }
            }
        }
    }

    /// Puts failed extensions back to their pre-tick lease fields so the
    /// next tick retries them.
    fn revert_plans(&self, plans: &[ExtendPlan], failed_ids: &[&str]) {
        if failed_ids.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for plan in plans {
            if !failed_ids.contains(&plan.entry.id.as_str()) {
                continue;
            }
            if let Some(job) = state.jobs.get_mut(&plan.entry.id) {
                job.visibility_timeout_secs = plan.prev_timeout_secs;
                job.extend_at_secs = plan.prev_extend_at_secs;
            }
        }
    }

    async fn delete_queue(&self, queue: &QueuePair, entries: Vec<DeleteEntry>) {
        for chunk in entries.chunks(BATCH_LIMIT) {
            match self.client.delete_batch(queue, chunk).await {
                Ok(result) => {
                    self.events.emit(&LifecycleEvent::delete_messages(
                        &queue.name,
                        result.successful.len(),
                        result.failed.len(),
                    ));
                    for failure in &result.failed {
                        warn!(
                            message_id = %failure.id,
                            queue = %queue.name,
                            reason = %failure.reason,
                            "Failed to delete completed message"
                        );
                    }
                }
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Delete batch failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputMode;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::{SendOptions, ATTR_VISIBILITY_TIMEOUT};
    use std::time::Duration;

    fn sink() -> Arc<EventSink> {
        Arc::new(EventSink::new(OutputMode::Quiet))
    }

    async fn setup(
        visibility_secs: u32,
    ) -> (Arc<InMemoryQueue>, Arc<LeaseManager>, QueuePair, Message) {
        let client = Arc::new(InMemoryQueue::new());
        let mut attrs = HashMap::new();
        attrs.insert(
            ATTR_VISIBILITY_TIMEOUT.to_string(),
            visibility_secs.to_string(),
        );
        let locator = client.create_queue("qrelay_lease", &attrs).await.unwrap();
        let queue = QueuePair::new("qrelay_lease", locator);
        client
            .send(&queue, "true", &SendOptions::default())
            .await
            .unwrap();
        let message = client
            .receive(&queue, 1, Duration::from_millis(50))
            .await
            .unwrap()
            .remove(0);
        let manager = Arc::new(LeaseManager::new(
            client.clone(),
            sink(),
            LeaseOptions::default(),
        ));
        manager
            .register(&queue, &message, visibility_secs)
            .unwrap();
        (client, manager, queue, message)
    }

    #[test]
    fn test_next_extension_doubles_and_sets_midpoint() {
        let (timeout, extend_at) = next_extension(30, 15).unwrap();
        assert_eq!(timeout, 60);
        assert_eq!(extend_at, 45);

        let (timeout, extend_at) = next_extension(60, 45).unwrap();
        assert_eq!(timeout, 120);
        assert_eq!(extend_at, 105);
    }

    #[test]
    fn test_next_extension_caps_at_ceiling() {
        // Close to the ceiling the doubled value is clamped to what's left.
        let (timeout, _) = next_extension(30_000, MAX_JOB_RUN_SECS - 200).unwrap();
        assert_eq!(timeout, 200);

        // At or past the ceiling there is no further growth.
        assert!(next_extension(30, MAX_JOB_RUN_SECS).is_none());
        assert!(next_extension(30, MAX_JOB_RUN_SECS + 5).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_receipt_is_fatal_and_references_existing_job() {
        let (_client, manager, queue, message) = setup(30).await;
        let err = manager.register(&queue, &message, 30).unwrap_err();
        match err {
            WorkerError::DuplicateReceipt {
                message_id, queue, ..
            } => {
                assert_eq!(message_id, message.message_id);
                assert_eq!(queue, "qrelay_lease");
            }
            other => panic!("expected DuplicateReceipt, got {other:?}"),
        }
        // The original job is still tracked.
        assert_eq!(manager.tracked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_extends_once_threshold_reached() {
        let (client, manager, _queue, message) = setup(30).await;
        manager.mark_running(&message.message_id).unwrap();

        // Before the threshold nothing happens.
        manager.tick().await;
        assert_eq!(client.counters().extend_calls(), 0);

        tokio::time::sleep(Duration::from_secs(16)).await;
        manager.tick().await;
        assert_eq!(client.counters().extend_calls(), 1);
        assert_eq!(client.counters().extend_entries(), 1);

        // Threshold moved to the midpoint of the new 60s window; the next
        // tick is quiet.
        manager.tick().await;
        assert_eq!(client.counters().extend_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_job_is_deleted_not_extended() {
        let (client, manager, _queue, message) = setup(30).await;
        manager.mark_running(&message.message_id).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.mark_complete(&message.message_id).unwrap();

        manager.tick().await;
        assert_eq!(client.counters().extend_calls(), 0);
        assert_eq!(client.counters().delete_calls(), 1);
        assert_eq!(client.counters().delete_entries(), 1);
        assert_eq!(manager.tracked(), 0);

        // Exactly one delete: further ticks have nothing to do.
        manager.tick().await;
        assert_eq!(client.counters().delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_dropped_without_delete() {
        let (client, manager, _queue, message) = setup(30).await;
        manager.mark_failed(&message.message_id).unwrap();

        manager.tick().await;
        assert_eq!(client.counters().delete_calls(), 0);
        assert_eq!(manager.tracked(), 0);
        // The delivery stays in flight until its timeout expires.
        assert_eq!(client.inflight_len("qrelay_lease"), 1);
    }

    #[tokio::test]
    async fn test_release_returns_message_immediately() {
        let (client, manager, queue, message) = setup(30).await;
        manager.release(&message.message_id).await.unwrap();
        assert_eq!(manager.tracked(), 0);

        let again = client
            .receive(&queue, 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_loop_exits_once_empty() {
        let (client, manager, _queue, message) = setup(30).await;
        let cancel = CancellationToken::new();
        let handle = manager.spawn(cancel.clone());

        manager.mark_complete(&message.message_id).unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(client.counters().delete_calls(), 1);
        assert_eq!(manager.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_failure_is_retried_next_tick() {
        let (client, manager, queue, message) = setup(30).await;
        manager.mark_running(&message.message_id).unwrap();

        // Sabotage: settle the delivery behind the manager's back so the
        // extension hits an unknown receipt.
        client
            .delete_batch(
                &queue,
                &[DeleteEntry {
                    id: message.message_id.clone(),
                    receipt_handle: message.receipt_handle.clone(),
                }],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        manager.tick().await;

        // The entry failed, so the lease fields were reverted and the next
        // tick tries again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.tick().await;
        assert_eq!(client.counters().extend_calls(), 2);
    }
}
