//! Data types shared by the breaker, queue, and process supervisor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One invocation of an external binary.
///
/// Arguments are handed to the OS as an argv array; nothing is ever
/// interpolated through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub binary: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

impl Command {
    pub fn new(binary: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            args,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of one attempt. Produced once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Process exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How a finished attempt was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded,
    Exited,
    TimedOut,
    SpawnFailed,
}

/// Lifecycle and state events published by the supervisor.
///
/// Advisory only: nothing in the control flow depends on whether anyone
/// is subscribed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SupervisorEvent {
    StateChange {
        previous: CircuitState,
        next: CircuitState,
        consecutive_failures: u32,
    },
    CommandQueued {
        binary: String,
        queued: usize,
    },
    CommandStarted {
        binary: String,
        args: Vec<String>,
        waited_ms: u64,
    },
    CommandFinished {
        binary: String,
        outcome: CommandOutcome,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    QueueCleared {
        reason: String,
        cancelled: usize,
    },
}
