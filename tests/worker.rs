//! End-to-end worker tests against the in-memory queue backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use qrelay::config::{LeaseOptions, WorkerOptions};
use qrelay::events::OutputMode;
use qrelay::queue::memory::InMemoryQueue;
use qrelay::queue::{QueueClient, QueuePair, SendOptions, ATTR_VISIBILITY_TIMEOUT};
use qrelay::worker::{JobError, JobHandler, PollingScheduler};

fn fast_options() -> WorkerOptions {
    // The receive wait spans several lease ticks so a settled message's
    // delete always lands inside the next poll's window.
    WorkerOptions::default()
        .with_wait_time(Duration::from_millis(300))
        .with_resolve_interval(Duration::from_millis(100))
        .with_kill_after(Duration::from_secs(30))
        .with_drain(true)
        .with_nice(None)
        .with_output(OutputMode::Quiet)
        .with_lease(
            LeaseOptions::default()
                .with_tick(Duration::from_millis(100))
                .with_drain_tick(Duration::from_millis(50)),
        )
}

async fn create_queue(client: &InMemoryQueue, name: &str, visibility_secs: u32) -> QueuePair {
    let mut attrs = HashMap::new();
    attrs.insert(
        ATTR_VISIBILITY_TIMEOUT.to_string(),
        visibility_secs.to_string(),
    );
    let locator = client.create_queue(name, &attrs).await.unwrap();
    QueuePair::new(name, locator)
}

async fn enqueue(client: &InMemoryQueue, queue: &QueuePair, bodies: &[&str]) {
    for body in bodies {
        client
            .send(queue, body, &SendOptions::default())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn successful_job_is_deleted_exactly_once() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_ok", 30).await;
    enqueue(&client, &queue, &["true"]).await;

    let scheduler = PollingScheduler::new(client.clone(), fast_options(), CancellationToken::new());
    let stats = scheduler.listen(&["ok".to_string()]).await.unwrap();

    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.jobs_failed, 0);
    assert_eq!(client.counters().delete_entries(), 1);
    assert_eq!(client.ready_len("qrelay_ok"), 0);
    assert_eq!(client.inflight_len("qrelay_ok"), 0);
}

#[tokio::test]
async fn failed_job_is_left_for_redrive() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_bad", 30).await;
    enqueue(&client, &queue, &["false"]).await;

    let scheduler = PollingScheduler::new(client.clone(), fast_options(), CancellationToken::new());
    let stats = scheduler.listen(&["bad".to_string()]).await.unwrap();

    assert_eq!(stats.jobs_succeeded, 0);
    assert_eq!(stats.jobs_failed, 1);
    // No delete: the delivery stays hidden until its visibility timeout
    // expires and the queue service's own redrive policy takes over.
    assert_eq!(client.counters().delete_entries(), 0);
    assert_eq!(client.inflight_len("qrelay_bad"), 1);
}

#[tokio::test]
async fn long_job_gets_extended_before_completing() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_slow", 2).await;
    enqueue(&client, &queue, &["sleep 3"]).await;

    let opts = fast_options().with_visibility_timeout_secs(2);
    let scheduler = PollingScheduler::new(client.clone(), opts, CancellationToken::new());
    let stats = scheduler.listen(&["slow".to_string()]).await.unwrap();

    // The job outlived its initial 2s visibility window, so at least one
    // extension fired, and it still completed exactly once.
    assert!(client.counters().extend_calls() >= 1);
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.jobs_failed, 0);
    assert_eq!(client.counters().delete_entries(), 1);
    assert_eq!(client.inflight_len("qrelay_slow"), 0);
}

#[tokio::test]
async fn wildcard_pattern_drains_every_matching_queue() {
    let client = Arc::new(InMemoryQueue::new());
    for name in ["qrelay_test1", "qrelay_test2", "qrelay_test3"] {
        let queue = create_queue(&client, name, 30).await;
        enqueue(&client, &queue, &["true"]).await;
    }
    // The failure companion must be left alone.
    let failed = create_queue(&client, "qrelay_test1_failed", 30).await;
    enqueue(&client, &failed, &["true"]).await;

    let scheduler = PollingScheduler::new(client.clone(), fast_options(), CancellationToken::new());
    let stats = scheduler.listen(&["test*".to_string()]).await.unwrap();

    assert_eq!(stats.jobs_succeeded, 3);
    assert_eq!(client.ready_len("qrelay_test1_failed"), 1);
}

struct Recorder {
    seen: Mutex<Vec<String>>,
    delay: Duration,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, _queue: &str, payload: &str) -> Result<(), JobError> {
        {
            let mut seen = self.seen.lock().unwrap();
            seen.push(payload.to_string());
        }
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn fifo_same_group_messages_run_in_receipt_order() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_seq.fifo", 30).await;
    for body in ["first", "second", "third"] {
        client
            .send(
                &queue,
                body,
                &SendOptions {
                    group_id: Some("g1".to_string()),
                },
            )
            .await
            .unwrap();
    }

    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
        delay: Duration::from_millis(50),
    });
    let opts = fast_options().with_fifo(true);
    let scheduler = PollingScheduler::new(client.clone(), opts, CancellationToken::new());
    let stats = scheduler
        .process_messages(&["seq*".to_string()], recorder.clone())
        .await
        .unwrap();

    assert_eq!(stats.jobs_succeeded, 3);
    let seen = recorder.seen.lock().unwrap();
    assert_eq!(*seen, vec!["first", "second", "third"]);
}

struct Refuser;

#[async_trait]
impl JobHandler for Refuser {
    async fn handle(&self, _queue: &str, _payload: &str) -> Result<(), JobError> {
        Err(JobError::Refuse)
    }
}

#[tokio::test]
async fn refused_message_is_immediately_visible_again() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_nope", 30).await;
    enqueue(&client, &queue, &["anything"]).await;

    let scheduler = PollingScheduler::new(client.clone(), fast_options(), CancellationToken::new());
    let stats = scheduler
        .process_messages(&["nope".to_string()], Arc::new(Refuser))
        .await
        .unwrap();

    // Refusals count nowhere and the message went straight back.
    assert_eq!(stats.jobs_succeeded, 0);
    assert_eq!(stats.jobs_failed, 0);
    assert_eq!(client.counters().delete_entries(), 0);
    assert_eq!(client.ready_len("qrelay_nope"), 1);
}

#[tokio::test]
async fn shutdown_finishes_the_job_in_hand() {
    let client = Arc::new(InMemoryQueue::new());
    let queue = create_queue(&client, "qrelay_busy", 30).await;
    enqueue(&client, &queue, &["sleep 1"]).await;

    let cancel = CancellationToken::new();
    let mut opts = fast_options();
    opts.drain = false;
    let scheduler = Arc::new(PollingScheduler::new(client.clone(), opts, cancel.clone()));

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.listen(&["busy".to_string()]).await });

    // Let the poll loop pick the job up, then request shutdown twice
    // (idempotent) while it is still running.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    cancel.cancel();

    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(client.counters().delete_entries(), 1);
    assert_eq!(client.inflight_len("qrelay_busy"), 0);
}
