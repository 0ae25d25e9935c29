//! Job lifecycle events.
//!
//! One JSON object per line on stdout is the durable operational record an
//! operator greps; the event names are a compatibility contract and must
//! not change. Diagnostics and progress go to stderr so the two streams
//! never mix.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How lifecycle events are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// JSON events on stdout, short progress on stderr.
    Default,
    /// Nothing non-essential.
    Quiet,
    /// Human-readable progress on stderr only.
    Verbose,
}

/// A job lifecycle event.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    MessageProcessingStart {
        queue: String,
        message_id: String,
        payload: String,
        timestamp: DateTime<Utc>,
    },
    MessageProcessingComplete {
        queue: String,
        message_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    MessageProcessingFailed {
        queue: String,
        message_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ExtendVisibilityTimeouts {
        queue: String,
        count: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
    DeleteMessages {
        queue: String,
        count: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn processing_start(queue: &str, message_id: &str, payload: &str) -> Self {
        Self::MessageProcessingStart {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn processing_complete(queue: &str, message_id: &str, duration_ms: u64) -> Self {
        Self::MessageProcessingComplete {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn processing_failed(
        queue: &str,
        message_id: &str,
        exit_code: Option<i32>,
        signal: Option<i32>,
        duration_ms: u64,
    ) -> Self {
        Self::MessageProcessingFailed {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
            exit_code,
            signal,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn extend_visibility_timeouts(queue: &str, count: usize, failed: usize) -> Self {
        Self::ExtendVisibilityTimeouts {
            queue: queue.to_string(),
            count,
            failed,
            timestamp: Utc::now(),
        }
    }

    pub fn delete_messages(queue: &str, count: usize, failed: usize) -> Self {
        Self::DeleteMessages {
            queue: queue.to_string(),
            count,
            failed,
            timestamp: Utc::now(),
        }
    }

    /// Short human-readable form for stderr progress.
    fn describe(&self) -> String {
        match self {
            Self::MessageProcessingStart {
                queue, message_id, ..
            } => format!("{queue}: processing {message_id}"),
            Self::MessageProcessingComplete {
                queue,
                message_id,
                duration_ms,
                ..
            } => format!("{queue}: {message_id} complete in {duration_ms}ms"),
            Self::MessageProcessingFailed {
                queue,
                message_id,
                exit_code,
                signal,
                duration_ms,
                ..
            } => format!(
                "{queue}: {message_id} failed in {duration_ms}ms (exit {exit_code:?}, signal {signal:?})"
            ),
            Self::ExtendVisibilityTimeouts {
                queue,
                count,
                failed,
                ..
            } => format!("{queue}: extended {count} lease(s), {failed} failed"),
            Self::DeleteMessages {
                queue,
                count,
                failed,
                ..
            } => format!("{queue}: deleted {count} message(s), {failed} failed"),
        }
    }
}

/// Sink for lifecycle events, honoring the output mode.
#[derive(Debug)]
pub struct EventSink {
    mode: OutputMode,
}

impl EventSink {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn emit(&self, event: &LifecycleEvent) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Verbose => eprintln!("{}", event.describe()),
            OutputMode::Default => {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::error!(error = %e, "Failed to serialize lifecycle event"),
                }
                eprintln!("{}", event.describe());
            }
        }
    }
}
