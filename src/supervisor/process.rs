//! Process supervisor: breaker + queue + timeout around one external binary.
//!
//! Construct exactly one `ProcessSupervisor` per binary at start-up and
//! share it (`Arc`) with every consumer, so all calls go through the same
//! breaker and concurrency limit.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::breaker::{BreakerConfig, CircuitBreaker, Permit};
use super::metrics::{CommandMetrics, MetricsSnapshot};
use super::queue::{CommandQueue, QueueConfig};
use super::types::{Command, CommandOutcome, CommandResult, SupervisorEvent};
use crate::errors::SupervisorError;

/// Capacity of the supervisor event channel; slow subscribers lag, they
/// never block execution.
const EVENT_CAPACITY: usize = 256;

/// How long to wait for pipe readers after a timed-out process is killed.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: String,
    /// Default per-command timeout.
    pub timeout: Duration,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "bd".to_string(),
            timeout: Duration::from_secs(30),
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

pub struct ProcessSupervisor {
    binary: String,
    timeout: Duration,
    breaker: CircuitBreaker,
    queue: CommandQueue,
    metrics: CommandMetrics,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            binary: config.binary,
            timeout: config.timeout,
            breaker: CircuitBreaker::new(config.breaker, events.clone()),
            queue: CommandQueue::new(config.queue),
            metrics: CommandMetrics::default(),
            events,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Build a command for this supervisor's binary with the default timeout.
    pub fn command(&self, args: Vec<String>) -> Command {
        Command::new(self.binary.clone(), args, self.timeout)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Execute a command under breaker, queue, and timeout protection.
    ///
    /// Never retries: every failure goes straight back to the caller, who
    /// can consult the breaker state before trying again.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, SupervisorError> {
        let Some(permit) = self.breaker.admit() else {
            self.metrics.record_rejected();
            let retry_after = self.breaker.retry_after();
            tracing::warn!(
                binary = %command.binary,
                retry_after_ms = retry_after.as_millis() as u64,
                "circuit open, rejecting command"
            );
            return Err(SupervisorError::CircuitOpen {
                binary: command.binary,
                retry_after,
            });
        };

        if self.queue.active_count() >= self.queue.max_concurrent() {
            let _ = self.events.send(SupervisorEvent::CommandQueued {
                binary: command.binary.clone(),
                queued: self.queue.queued_count() + 1,
            });
        }

        // The permit travels with the job. If the job is cancelled in the
        // queue or this future is dropped, the permit is dropped unsettled
        // and a HalfOpen trial slot is released.
        self.queue
            .submit(command, |command, waited| self.run(command, waited, permit))
            .await
    }

    /// Cancel every queued command that has not started yet.
    pub fn clear_queue(&self, reason: &str) -> usize {
        let cancelled = self.queue.clear(reason);
        let _ = self.events.send(SupervisorEvent::QueueCleared {
            reason: reason.to_string(),
            cancelled,
        });
        cancelled
    }

    async fn run(
        &self,
        command: Command,
        waited: Duration,
        permit: Permit<'_>,
    ) -> Result<CommandResult, SupervisorError> {
        let waited_ms = waited.as_millis() as u64;
        tracing::debug!(binary = %command.binary, args = ?command.args, waited_ms, "starting command");
        let _ = self.events.send(SupervisorEvent::CommandStarted {
            binary: command.binary.clone(),
            args: command.args.clone(),
            waited_ms,
        });

        let started = Instant::now();
        let outcome = spawn_and_wait(&command).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => permit.record_success(),
            Err(_) => permit.record_failure(),
        }
        self.metrics.record_attempt(elapsed, outcome.is_err());

        let duration_ms = elapsed.as_millis() as u64;
        let totals = self.metrics.snapshot();
        let (kind, exit_code) = match &outcome {
            Ok(result) => {
                tracing::info!(
                    binary = %command.binary,
                    exit_code = result.exit_code,
                    duration_ms,
                    commands.total = totals.total,
                    commands.errors = totals.errors,
                    "command succeeded"
                );
                (CommandOutcome::Succeeded, Some(result.exit_code))
            }
            Err(err) => {
                tracing::warn!(
                    binary = %command.binary,
                    error = %err,
                    duration_ms,
                    commands.total = totals.total,
                    commands.errors = totals.errors,
                    "command failed"
                );
                match err {
                    SupervisorError::ProcessExit { result, .. } => {
                        (CommandOutcome::Exited, Some(result.exit_code))
                    }
                    SupervisorError::Timeout { .. } => (CommandOutcome::TimedOut, None),
                    _ => (CommandOutcome::SpawnFailed, None),
                }
            }
        };

        let _ = self.events.send(SupervisorEvent::CommandFinished {
            binary: command.binary.clone(),
            outcome: kind,
            exit_code,
            duration_ms,
        });
        outcome
    }
}

/// Spawn the binary directly (argv, no shell) and wait for it under the
/// command's timeout. The deadline covers both the exit and draining its
/// output, so a grandchild holding the pipes open cannot stretch the call.
/// A timed-out child is killed and reaped before returning.
async fn spawn_and_wait(command: &Command) -> Result<CommandResult, SupervisorError> {
    let started = Instant::now();
    let deadline = started + command.timeout();
    let mut child = tokio::process::Command::new(&command.binary)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            binary: command.binary.clone(),
            source,
        })?;

    let pid = child.id();
    let mut stdout_reader = child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
    let mut stderr_reader = child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
    let mut stdout: Option<String> = None;
    let mut stderr: Option<String> = None;

    let finished = tokio::time::timeout_at(deadline, async {
        let status = child.wait().await;
        stdout = Some(collect(&mut stdout_reader).await);
        stderr = Some(collect(&mut stderr_reader).await);
        status
    })
    .await;

    match finished {
        Ok(Ok(status)) => {
            let result = CommandResult {
                exit_code: status.code().unwrap_or(-1),
                stdout: stdout.unwrap_or_default(),
                stderr: stderr.unwrap_or_default(),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            };
            if status.success() {
                Ok(result)
            } else {
                Err(SupervisorError::ProcessExit {
                    binary: command.binary.clone(),
                    result,
                })
            }
        }
        Ok(Err(e)) => Err(SupervisorError::ProcessExit {
            binary: command.binary.clone(),
            result: CommandResult {
                exit_code: -1,
                stdout: stdout.unwrap_or_default(),
                stderr: format!("failed to wait for process: {e}"),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            },
        }),
        Err(_) => {
            // The child may already have exited with its pipes still held
            // by a background descendant.
            if !matches!(child.try_wait(), Ok(Some(_)))
                && let Err(e) = child.kill().await
            {
                tracing::warn!(binary = %command.binary, ?pid, error = %e, "failed to kill timed-out process");
            }
            let drain = async {
                if stdout.is_none() {
                    stdout = Some(collect(&mut stdout_reader).await);
                }
                if stderr.is_none() {
                    stderr = Some(collect(&mut stderr_reader).await);
                }
            };
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await.is_err() {
                tracing::debug!(binary = %command.binary, "output still open after kill, abandoning it");
            }
            for reader in [stdout_reader.take(), stderr_reader.take()].into_iter().flatten() {
                reader.abort();
            }
            Err(SupervisorError::Timeout {
                binary: command.binary.clone(),
                timeout: command.timeout(),
                pid,
                stdout: stdout.unwrap_or_default(),
                stderr: stderr.unwrap_or_default(),
            })
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "pipe read ended early");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Await a pipe reader, clearing it once it has produced its output.
async fn collect(reader: &mut Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader.as_mut() else {
        return String::new();
    };
    let text = handle.await.unwrap_or_default();
    *reader = None;
    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::supervisor::types::CircuitState;

    fn supervisor(binary: &str, threshold: u32, reset: Duration) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            binary: binary.to_string(),
            timeout: Duration::from_secs(10),
            queue: QueueConfig {
                max_concurrent: 2,
                max_queue_depth: None,
            },
            breaker: BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: reset,
            },
        })
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let sup = supervisor("sh", 5, Duration::from_secs(60));
        let result = sup
            .execute(sup.command(sh("printf hello; printf warn >&2")))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.stderr, "warn");
        assert!(!result.timed_out);
        assert_eq!(sup.metrics().total, 1);
        assert_eq!(sup.metrics().errors, 0);
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpolated() {
        let sup = supervisor("printf", 5, Duration::from_secs(60));
        let args = vec!["%s".to_string(), "$(echo injected); rm -rf /".to_string()];
        let result = sup.execute(sup.command(args)).await.unwrap();
        assert_eq!(result.stdout, "$(echo injected); rm -rf /");
    }

    #[tokio::test]
    async fn nonzero_exit_rejects_with_output() {
        let sup = supervisor("sh", 5, Duration::from_secs(60));
        let err = sup
            .execute(sup.command(sh("echo partial; echo 'no such issue' >&2; exit 3")))
            .await
            .unwrap_err();
        match &err {
            SupervisorError::ProcessExit { result, .. } => {
                assert_eq!(result.exit_code, 3);
                assert_eq!(result.stdout, "partial\n");
                assert_eq!(result.stderr, "no such issue\n");
            }
            other => panic!("Expected ProcessExit, got {:?}", other),
        }
        assert_eq!(err.kind(), FailureKind::CommandFailed);
        assert_eq!(sup.breaker().consecutive_failures(), 1);
        assert_eq!(sup.metrics().errors, 1);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let sup = supervisor("sleep", 5, Duration::from_secs(60));
        let cmd = sup
            .command(vec!["5".to_string()])
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = sup.execute(cmd).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));

        match err {
            SupervisorError::Timeout { timeout, pid, .. } => {
                assert_eq!(timeout, Duration::from_millis(200));
                let pid = pid.expect("spawned process has a pid");
                #[cfg(target_os = "linux")]
                assert!(
                    !std::path::Path::new(&format!("/proc/{pid}")).exists(),
                    "timed-out process {pid} is still alive"
                );
                let _ = pid;
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        assert_eq!(sup.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let sup = supervisor("kanban-relay-no-such-binary", 5, Duration::from_secs(60));
        let err = sup.execute(sup.command(vec![])).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert_eq!(err.kind(), FailureKind::BinaryMissing);
        assert_eq!(sup.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn open_breaker_stops_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("spawns.log");
        let script = format!("echo spawn >> '{}'; exit 1", log.display());
        let sup = supervisor("sh", 5, Duration::from_secs(60));

        for _ in 0..5 {
            let err = sup.execute(sup.command(sh(&script))).await.unwrap_err();
            assert!(matches!(err, SupervisorError::ProcessExit { .. }));
        }
        assert_eq!(sup.breaker().state(), CircuitState::Open);

        let err = sup.execute(sup.command(sh(&script))).await.unwrap_err();
        assert!(matches!(err, SupervisorError::CircuitOpen { .. }));
        assert_eq!(err.kind(), FailureKind::CircuitOpen);

        let spawns = std::fs::read_to_string(&log).unwrap();
        assert_eq!(spawns.lines().count(), 5);
        assert_eq!(sup.metrics().total, 5);
        assert_eq!(sup.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes_breaker() {
        let sup = supervisor("sh", 2, Duration::from_millis(100));
        for _ in 0..2 {
            let _ = sup.execute(sup.command(sh("exit 1"))).await;
        }
        assert_eq!(sup.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        sup.execute(sup.command(sh("exit 0"))).await.unwrap();
        assert_eq!(sup.breaker().state(), CircuitState::Closed);
        assert_eq!(sup.breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens_breaker() {
        let sup = supervisor("sh", 1, Duration::from_millis(100));
        let _ = sup.execute(sup.command(sh("exit 1"))).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = sup.execute(sup.command(sh("exit 2"))).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessExit { .. }));
        assert_eq!(sup.breaker().state(), CircuitState::Open);

        let err = sup.execute(sup.command(sh("exit 0"))).await.unwrap_err();
        assert!(matches!(err, SupervisorError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn background_descendant_cannot_outlive_the_timeout() {
        let sup = supervisor("sh", 5, Duration::from_secs(60));
        let cmd = sup
            .command(sh("sleep 3 & echo started"))
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = sup.execute(cmd).await.unwrap_err();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "execute took {:?}",
            started.elapsed()
        );
        assert!(matches!(err, SupervisorError::Timeout { .. }));
        assert_eq!(sup.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn aborted_trial_does_not_wedge_the_breaker() {
        let sup = std::sync::Arc::new(supervisor("sh", 1, Duration::from_millis(100)));
        let _ = sup.execute(sup.command(sh("exit 1"))).await;
        assert_eq!(sup.breaker().state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let trial = {
            let sup = std::sync::Arc::clone(&sup);
            tokio::spawn(async move { sup.execute(sup.command(sh("sleep 2"))).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.breaker().state(), CircuitState::HalfOpen);
        trial.abort();
        assert!(trial.await.unwrap_err().is_cancelled());

        sup.execute(sup.command(sh("exit 0"))).await.unwrap();
        assert_eq!(sup.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn straggler_success_does_not_close_half_open() {
        let sup = std::sync::Arc::new(supervisor("sh", 1, Duration::from_millis(100)));
        let straggler = {
            let sup = std::sync::Arc::clone(&sup);
            tokio::spawn(async move { sup.execute(sup.command(sh("sleep 0.4"))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = sup.execute(sup.command(sh("exit 1"))).await;
        assert_eq!(sup.breaker().state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let trial = {
            let sup = std::sync::Arc::clone(&sup);
            tokio::spawn(async move { sup.execute(sup.command(sh("sleep 1; exit 1"))).await })
        };
        straggler.await.unwrap().unwrap();
        assert_eq!(sup.breaker().state(), CircuitState::HalfOpen);

        assert!(trial.await.unwrap().is_err());
        assert_eq!(sup.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let sup = supervisor("sh", 5, Duration::from_secs(60));
        let mut events = sup.subscribe();
        sup.execute(sup.command(sh("exit 0"))).await.unwrap();

        match events.recv().await.unwrap() {
            SupervisorEvent::CommandStarted { binary, args, .. } => {
                assert_eq!(binary, "sh");
                assert_eq!(args, sh("exit 0"));
            }
            other => panic!("Expected CommandStarted, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            SupervisorEvent::CommandFinished {
                outcome, exit_code, ..
            } => {
                assert_eq!(outcome, CommandOutcome::Succeeded);
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("Expected CommandFinished, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn clear_queue_cancels_waiting_commands() {
        let sup = std::sync::Arc::new(ProcessSupervisor::new(SupervisorConfig {
            binary: "sleep".to_string(),
            timeout: Duration::from_secs(10),
            queue: QueueConfig {
                max_concurrent: 1,
                max_queue_depth: None,
            },
            breaker: BreakerConfig::default(),
        }));

        let running = {
            let sup = std::sync::Arc::clone(&sup);
            tokio::spawn(async move { sup.execute(sup.command(vec!["0.3".to_string()])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = {
            let sup = std::sync::Arc::clone(&sup);
            tokio::spawn(async move { sup.execute(sup.command(vec!["0".to_string()])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.queue().queued_count(), 1);

        assert_eq!(sup.clear_queue("shutdown"), 1);
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled { .. }));
        assert!(running.await.unwrap().is_ok());
        assert_eq!(sup.breaker().consecutive_failures(), 0);
    }
}
