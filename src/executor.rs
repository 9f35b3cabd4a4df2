//! Command execution seam between the HTTP surface and the supervisor.
//!
//! Real implementation: `ProcessSupervisor`. When process spawning is not
//! available (or turned off in config) the composition root installs a
//! `DisabledExecutor`, which rejects every call without touching the OS.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::SupervisorError;
use crate::supervisor::{CircuitState, Command, CommandResult, MetricsSnapshot, ProcessSupervisor};

/// Point-in-time view of an executor, served by `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub enabled: bool,
    pub binary: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until an open breaker admits a trial call.
    pub retry_after_ms: u64,
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub metrics: MetricsSnapshot,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> Result<CommandResult, SupervisorError>;

    /// Build a command for the executor's binary. `timeout` overrides the
    /// configured default.
    fn command(&self, args: Vec<String>, timeout: Option<Duration>) -> Command;

    fn status(&self) -> ExecutorStatus;
}

#[async_trait]
impl CommandExecutor for ProcessSupervisor {
    async fn execute(&self, command: Command) -> Result<CommandResult, SupervisorError> {
        ProcessSupervisor::execute(self, command).await
    }

    fn command(&self, args: Vec<String>, timeout: Option<Duration>) -> Command {
        let command = ProcessSupervisor::command(self, args);
        match timeout {
            Some(timeout) => command.with_timeout(timeout),
            None => command,
        }
    }

    fn status(&self) -> ExecutorStatus {
        let state = self.breaker().state();
        ExecutorStatus {
            enabled: true,
            binary: self.binary().to_string(),
            circuit_state: state,
            consecutive_failures: self.breaker().consecutive_failures(),
            retry_after_ms: match state {
                CircuitState::Open => self.breaker().retry_after().as_millis() as u64,
                _ => 0,
            },
            active: self.queue().active_count(),
            queued: self.queue().queued_count(),
            max_concurrent: self.queue().max_concurrent(),
            metrics: self.metrics(),
        }
    }
}

/// Executor used when command execution is switched off.
#[derive(Debug, Clone)]
pub struct DisabledExecutor {
    binary: String,
    reason: String,
}

impl DisabledExecutor {
    pub fn new(binary: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for DisabledExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResult, SupervisorError> {
        tracing::debug!(binary = %command.binary, reason = %self.reason, "command execution disabled");
        Err(SupervisorError::Spawn {
            binary: command.binary,
            source: io::Error::other(self.reason.clone()),
        })
    }

    fn command(&self, args: Vec<String>, timeout: Option<Duration>) -> Command {
        Command::new(
            self.binary.clone(),
            args,
            timeout.unwrap_or(Duration::from_secs(30)),
        )
    }

    fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            enabled: false,
            binary: self.binary.clone(),
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            retry_after_ms: 0,
            active: 0,
            queued: 0,
            max_concurrent: 0,
            metrics: MetricsSnapshot::default(),
        }
    }
}
