//! Job execution.
//!
//! Runs exactly one job to completion and reports a terminal outcome. The
//! hard kill deadline is enforced here regardless of whether the job is a
//! subprocess or an injected callback; queue side effects (delete, release)
//! are the scheduler's responsibility, which keeps the runner ignorant of
//! queue semantics and independently testable.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DEFAULT_KILL_AFTER;
use crate::error::RunnerError;

use super::job::JobOutcome;

/// Error type returned by callback-mode job handlers.
#[derive(Debug, Error)]
pub enum JobError {
    /// The handler declines this message; it is returned to immediate
    /// visibility so another consumer can pick it up.
    #[error("handler refused to process the message")]
    Refuse,

    /// The handler failed; the message is left for the redrive policy.
    #[error("job handler error: {0}")]
    Handler(#[from] anyhow::Error),
}

/// A callback-mode job handler, invoked once per message.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, queue: &str, payload: &str) -> Result<(), JobError>;
}

/// Configuration for job execution.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Hard deadline after which the job is killed.
    pub kill_after: Duration,
    /// Grace between the termination signal and the forceful kill.
    pub grace: Duration,
    /// Niceness for subprocesses; `None` runs them unniced.
    pub nice: Option<i32>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            kill_after: DEFAULT_KILL_AFTER,
            grace: Duration::from_secs(1),
            nice: Some(10),
        }
    }
}

impl RunnerOptions {
    pub fn new(kill_after: Duration) -> Self {
        Self {
            kill_after,
            ..Default::default()
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_nice(mut self, nice: Option<i32>) -> Self {
        self.nice = nice;
        self
    }
}

/// Executes single jobs under the configured kill deadline.
#[derive(Debug, Clone)]
pub struct JobRunner {
    opts: RunnerOptions,
}

impl JobRunner {
    pub fn new(opts: RunnerOptions) -> Self {
        Self { opts }
    }

    /// Runs a command payload through the shell.
    ///
    /// The child gets its own process group so the kill timer can signal
    /// shell-launched grandchildren too: SIGTERM to the group at the
    /// deadline, then SIGKILL to any survivors after the grace period.
    pub async fn run_command(&self, command: &str) -> JobOutcome {
        let mut cmd = match self.opts.nice {
            Some(n) => {
                let mut c = Command::new("nice");
                c.arg("-n").arg(n.to_string()).arg("sh");
                c
            }
            None => Command::new("sh"),
        };
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return JobOutcome::Failure {
                    exit_code: None,
                    signal: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(RunnerError::Spawn(e).to_string()),
                }
            }
        };
        let pid = child.id();

        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let mut killed = false;
        let wait_result = match tokio::time::timeout(self.opts.kill_after, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                killed = true;
                debug!(?pid, kill_after = ?self.opts.kill_after, "Job hit kill deadline");
                if let Some(pid) = pid {
                    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                        warn!(error = %e, "Failed to terminate job process group");
                    }
                }
                match tokio::time::timeout(self.opts.grace, child.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        if let Some(pid) = pid {
                            if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                                warn!(error = %e, "Failed to kill job process group");
                            }
                        }
                        child.wait().await
                    }
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let status = match wait_result {
            Ok(status) => status,
            Err(e) => {
                return JobOutcome::Failure {
                    exit_code: None,
                    signal: None,
                    stdout,
                    stderr,
                    error: Some(RunnerError::Wait(e).to_string()),
                }
            }
        };

        if status.success() && !killed {
            JobOutcome::Success { stdout, stderr }
        } else {
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            JobOutcome::Failure {
                exit_code: status.code(),
                signal,
                stdout,
                stderr,
                error: killed
                    .then(|| format!("killed after {:?} deadline", self.opts.kill_after)),
            }
        }
    }

    /// Invokes a callback-mode handler once, under the same kill deadline.
    ///
    /// Normal return is success, `JobError::Refuse` is a refusal, any other
    /// error (or the deadline) is a failure.
    pub async fn run_handler(
        &self,
        handler: &dyn JobHandler,
        queue: &str,
        payload: &str,
    ) -> JobOutcome {
        match tokio::time::timeout(self.opts.kill_after, handler.handle(queue, payload)).await {
            Ok(Ok(())) => JobOutcome::Success {
                stdout: String::new(),
                stderr: String::new(),
            },
            Ok(Err(JobError::Refuse)) => JobOutcome::Refused,
            Ok(Err(JobError::Handler(e))) => JobOutcome::Failure {
                exit_code: None,
                signal: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(e.to_string()),
            },
            Err(_) => JobOutcome::Failure {
                exit_code: None,
                signal: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!(
                    "handler killed after {:?} deadline",
                    self.opts.kill_after
                )),
            },
        }
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), RunnerError> {
    let pgid = Pid::from_raw(pid as i32);
    killpg(pgid, signal).map_err(|errno| RunnerError::Signal {
        pgid: pid as i32,
        errno,
    })
}

fn drain_pipe<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> JobRunner {
        JobRunner::new(RunnerOptions::new(Duration::from_secs(5)).with_nice(None))
    }

    #[tokio::test]
    async fn test_true_succeeds() {
        let outcome = runner().run_command("true").await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_false_fails_with_exit_code() {
        match runner().run_command("false").await {
            JobOutcome::Failure {
                exit_code, signal, ..
            } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(signal, None);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_capture() {
        match runner().run_command("echo out; echo err >&2").await {
            JobOutcome::Success { stdout, stderr } => {
                assert_eq!(stdout, "out\n");
                assert_eq!(stderr, "err\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_deadline_terminates_job() {
        let runner = JobRunner::new(
            RunnerOptions::new(Duration::from_millis(300))
                .with_grace(Duration::from_secs(1))
                .with_nice(None),
        );
        let started = std::time::Instant::now();
        match runner.run_command("sleep 30").await {
            JobOutcome::Failure { signal, error, .. } => {
                assert_eq!(signal, Some(libc_sigterm()));
                assert!(error.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Terminated well before the sleep would have finished.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_kill_deadline_covers_shell_children() {
        // The payload spawns a grandchild; group signalling must reach it.
        let runner = JobRunner::new(
            RunnerOptions::new(Duration::from_millis(300))
                .with_grace(Duration::from_secs(1))
                .with_nice(None),
        );
        let outcome = runner.run_command("sleep 30 & wait").await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_spawn_error_is_failure() {
        // Empty program name cannot spawn.
        let runner = JobRunner::new(RunnerOptions::new(Duration::from_secs(5)).with_nice(None));
        // `sh -c` with an unrunnable command still exits non-zero rather
        // than failing to spawn, so exercise the exit-code path.
        match runner.run_command("exec /nonexistent-qrelay-binary").await {
            JobOutcome::Failure { exit_code, .. } => {
                assert!(exit_code.is_some());
                assert_ne!(exit_code, Some(0));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }

    struct Flaky;

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _queue: &str, payload: &str) -> Result<(), JobError> {
            match payload {
                "ok" => Ok(()),
                "refuse" => Err(JobError::Refuse),
                other => Err(anyhow::anyhow!("bad payload: {other}").into()),
            }
        }
    }

    #[tokio::test]
    async fn test_handler_outcomes() {
        let runner = runner();
        assert!(runner.run_handler(&Flaky, "q", "ok").await.is_success());
        assert!(matches!(
            runner.run_handler(&Flaky, "q", "refuse").await,
            JobOutcome::Refused
        ));
        assert!(matches!(
            runner.run_handler(&Flaky, "q", "boom").await,
            JobOutcome::Failure { .. }
        ));
    }

    struct Stuck;

    #[async_trait]
    impl JobHandler for Stuck {
        async fn handle(&self, _queue: &str, _payload: &str) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_kill_deadline() {
        let runner = JobRunner::new(RunnerOptions::new(Duration::from_secs(10)));
        match runner.run_handler(&Stuck, "q", "x").await {
            JobOutcome::Failure { error, .. } => {
                assert!(error.unwrap().contains("deadline"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
