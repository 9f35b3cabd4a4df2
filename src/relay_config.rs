//! Configuration for kanban-relay, read from `relay.toml`.
//!
//! Layering: file defaults → `relay.toml` → `KANBAN_RELAY_*` environment
//! variables → CLI flags (applied by the `serve` command).
//!
//! ```toml
//! [supervisor]
//! binary = "bd"
//! timeout_ms = 30000
//!
//! [queue]
//! max_concurrent = 3
//!
//! [breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 60000
//!
//! [watcher]
//! dir = ".beads"
//! debounce_ms = 100
//!
//! [server]
//! port = 3142
//!
//! [client]
//! reconnect_delay_ms = 1000
//! max_reconnect_delay_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::live::{ClientConfig, ServerConfig};
use crate::supervisor::{BreakerConfig, QueueConfig, SupervisorConfig};
use crate::watcher::{WatchFilter, WatcherConfig};

pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

pub const ENV_BINARY: &str = "KANBAN_RELAY_BINARY";
pub const ENV_PORT: &str = "KANBAN_RELAY_PORT";
pub const ENV_WATCH_DIR: &str = "KANBAN_RELAY_WATCH_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Set to false to serve without ever spawning the binary.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Waiting entries allowed before submissions fail with `QueueFull`.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watch_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_snapshot_suffixes")]
    pub snapshot_suffixes: Vec<String>,
    #[serde(default = "default_journal_suffixes")]
    pub journal_suffixes: Vec<String>,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Allow cross-origin requests (useful with a separately served UI).
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSection {
    /// Server URL for `tail`; defaults to the local `[server]` address.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_binary() -> String {
    "bd".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from(".beads")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_snapshot_suffixes() -> Vec<String> {
    vec![".db".to_string()]
}

fn default_journal_suffixes() -> Vec<String> {
    vec![".jsonl".to_string()]
}

fn default_recovery_interval_ms() -> u64 {
    1_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_channel_capacity() -> usize {
    256
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_binary(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_depth: None,
        }
    }
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_watch_dir(),
            debounce_ms: default_debounce_ms(),
            snapshot_suffixes: default_snapshot_suffixes(),
            journal_suffixes: default_journal_suffixes(),
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channel_capacity: default_channel_capacity(),
            cors: false,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: None,
        }
    }
}

/// Root of `relay.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

impl RelayConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_at(&content, path)
    }

    /// Load, apply environment overrides, and validate.
    pub fn load_effective(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env()?;
        config.ensure_valid()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_at(content, Path::new(DEFAULT_CONFIG_FILE))
    }

    fn parse_at(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `KANBAN_RELAY_*` overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup(ENV_BINARY).filter(|v| !v.is_empty()) {
            self.supervisor.binary = binary;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                problems: vec![format!("{ENV_PORT}='{port}' is not a valid port")],
            })?;
        }
        if let Some(dir) = lookup(ENV_WATCH_DIR).filter(|v| !v.is_empty()) {
            self.watcher.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Every problem found; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.supervisor.binary.trim().is_empty() {
            problems.push("supervisor.binary must not be empty".to_string());
        }
        if self.queue.max_concurrent == 0 {
            problems.push("queue.max_concurrent must be at least 1".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            problems.push("breaker.failure_threshold must be at least 1".to_string());
        }
        for (name, value) in [
            ("supervisor.timeout_ms", self.supervisor.timeout_ms),
            ("breaker.reset_timeout_ms", self.breaker.reset_timeout_ms),
            ("watcher.recovery_interval_ms", self.watcher.recovery_interval_ms),
            ("client.reconnect_delay_ms", self.client.reconnect_delay_ms),
            ("client.max_reconnect_delay_ms", self.client.max_reconnect_delay_ms),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }
        if self.watcher.snapshot_suffixes.is_empty() && self.watcher.journal_suffixes.is_empty() {
            problems.push("watcher needs at least one snapshot or journal suffix".to_string());
        }
        if self
            .watcher
            .snapshot_suffixes
            .iter()
            .chain(&self.watcher.journal_suffixes)
            .any(|s| s.is_empty())
        {
            problems.push("watcher suffixes must not be empty strings".to_string());
        }
        if self.server.channel_capacity == 0 {
            problems.push("server.channel_capacity must be at least 1".to_string());
        }
        if self.client.reconnect_delay_ms > self.client.max_reconnect_delay_ms {
            problems.push(format!(
                "client.reconnect_delay_ms ({}) exceeds client.max_reconnect_delay_ms ({})",
                self.client.reconnect_delay_ms, self.client.max_reconnect_delay_ms
            ));
        }

        problems
    }

    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary: self.supervisor.binary.clone(),
            timeout: Duration::from_millis(self.supervisor.timeout_ms),
            queue: QueueConfig {
                max_concurrent: self.queue.max_concurrent,
                max_queue_depth: self.queue.max_queue_depth,
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
            },
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            dir: self.watcher.dir.clone(),
            debounce: Duration::from_millis(self.watcher.debounce_ms),
            filter: WatchFilter {
                snapshot_suffixes: self.watcher.snapshot_suffixes.clone(),
                journal_suffixes: self.watcher.journal_suffixes.clone(),
            },
            recovery_interval: Duration::from_millis(self.watcher.recovery_interval_ms),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            channel_capacity: self.server.channel_capacity,
            permissive_cors: self.server.cors,
        }
    }

    /// The live-channel URL of the locally configured server.
    pub fn local_url(&self) -> String {
        format!("ws://{}:{}/ws", self.server.host, self.server.port)
    }

    /// Client settings; `url` overrides both `client.url` and the local address.
    pub fn client_config(&self, url: Option<&str>) -> ClientConfig {
        let url = url
            .map(str::to_string)
            .or_else(|| self.client.url.clone())
            .unwrap_or_else(|| self.local_url());
        ClientConfig {
            url,
            reconnect_delay: Duration::from_millis(self.client.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.client.max_reconnect_delay_ms),
            max_reconnect_attempts: self.client.max_reconnect_attempts,
        }
    }
}
