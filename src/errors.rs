//! Typed error hierarchy for kanban-relay.
//!
//! One enum per subsystem:
//! - `SupervisorError`: external command execution (breaker, queue, process)
//! - `WatchError`: filesystem watcher faults (never fatal to the watcher)
//! - `ServerError`: broadcast server lifecycle
//! - `ClientError`: reconnecting client connection faults
//! - `ConfigError`: `relay.toml` loading and validation

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::supervisor::types::CommandResult;

/// Errors from executing an external command through the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The breaker rejected the call; the binary was never spawned.
    #[error("Circuit open for {binary}; retry in {}ms", .retry_after.as_millis())]
    CircuitOpen { binary: String, retry_after: Duration },

    #[error("{binary} timed out after {}ms and was killed", .timeout.as_millis())]
    Timeout {
        binary: String,
        timeout: Duration,
        pid: Option<u32>,
        stdout: String,
        stderr: String,
    },

    #[error("{binary} exited with code {}: {}", .result.exit_code, .result.stderr.trim())]
    ProcessExit { binary: String, result: CommandResult },

    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command cancelled before it started: {reason}")]
    Cancelled { reason: String },

    #[error("Command queue is full ({depth} waiting)")]
    QueueFull { depth: usize },
}

/// Coarse failure classes surfaced to UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Breaker open, try again shortly.
    CircuitOpen,
    /// Command ran (or timed out) and failed; output is attached.
    CommandFailed,
    /// Binary missing or not executable; retries will not help.
    BinaryMissing,
    /// Never started: cancelled or rejected by queue backpressure.
    Cancelled,
}

impl SupervisorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SupervisorError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            SupervisorError::Timeout { .. } | SupervisorError::ProcessExit { .. } => {
                FailureKind::CommandFailed
            }
            SupervisorError::Spawn { .. } => FailureKind::BinaryMissing,
            SupervisorError::Cancelled { .. } | SupervisorError::QueueFull { .. } => {
                FailureKind::Cancelled
            }
        }
    }

    /// Whether this outcome was recorded as a failure on the circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            SupervisorError::Timeout { .. }
                | SupervisorError::ProcessExit { .. }
                | SupervisorError::Spawn { .. }
        )
    }
}

/// Filesystem watcher faults. Reported as events; the watcher keeps running.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watched directory {path} is missing")]
    DirectoryMissing { path: PathBuf },

    #[error("Watched directory {path} was removed and recreated")]
    DirectoryReplaced { path: PathBuf },

    #[error("Filesystem watch on {path} failed: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Errors from the broadcast server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broadcast server is already running on {addr}")]
    AlreadyRunning { addr: std::net::SocketAddr },
}

/// Errors raised by the reconnecting client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("Not connected to {url}")]
    NotConnected { url: String },

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from loading, validating, or writing `relay.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_result(code: i32, stderr: &str) -> CommandResult {
        CommandResult {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 12,
            timed_out: false,
        }
    }

    #[test]
    fn circuit_open_is_not_a_breaker_failure() {
        let err = SupervisorError::CircuitOpen {
            binary: "bd".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.kind(), FailureKind::CircuitOpen);
        assert!(!err.counts_as_failure());
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn process_exit_message_carries_stderr() {
        let err = SupervisorError::ProcessExit {
            binary: "bd".to_string(),
            result: exit_result(3, "no such issue\n"),
        };
        assert_eq!(err.kind(), FailureKind::CommandFailed);
        assert!(err.counts_as_failure());
        let msg = err.to_string();
        assert!(msg.contains("code 3"));
        assert!(msg.ends_with("no such issue"));
    }

    #[test]
    fn spawn_failure_maps_to_binary_missing() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "bd not found");
        let err = SupervisorError::Spawn {
            binary: "bd".to_string(),
            source: io_err,
        };
        assert_eq!(err.kind(), FailureKind::BinaryMissing);
        assert!(err.counts_as_failure());
        match &err {
            SupervisorError::Spawn { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn variant"),
        }
    }

    #[test]
    fn cancellation_and_backpressure_do_not_count() {
        let cancelled = SupervisorError::Cancelled {
            reason: "shutdown".to_string(),
        };
        let full = SupervisorError::QueueFull { depth: 8 };
        assert_eq!(cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(full.kind(), FailureKind::Cancelled);
        assert!(!cancelled.counts_as_failure());
        assert!(!full.counts_as_failure());
        assert!(cancelled.to_string().contains("shutdown"));
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::BinaryMissing).unwrap();
        assert_eq!(json, "\"binary_missing\"");
    }

    #[test]
    fn config_invalid_joins_problems() {
        let err = ConfigError::Invalid {
            problems: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Invalid configuration: a; b");
    }

    #[test]
    fn all_errors_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SupervisorError::QueueFull { depth: 1 });
        assert_std_error(&WatchError::DirectoryMissing {
            path: PathBuf::from(".beads"),
        });
        assert_std_error(&ClientError::NotConnected {
            url: "ws://localhost".to_string(),
        });
        assert_std_error(&ConfigError::Invalid { problems: vec![] });
    }
}
