//! Composition root for `kanban-relay serve`.
//!
//! One supervisor for the configured binary, one watcher over the issue
//! store, one live server carrying both `/ws` and the HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use kanban_relay::api::{self, ApiState};
use kanban_relay::executor::{CommandExecutor, DisabledExecutor};
use kanban_relay::live::{BroadcastServer, Broadcaster, Envelope};
use kanban_relay::relay_config::RelayConfig;
use kanban_relay::supervisor::ProcessSupervisor;
use kanban_relay::telemetry;
use kanban_relay::watcher::{DebouncedFileWatcher, WatchEvent};

/// CLI flags layered over relay.toml and the environment.
#[derive(Debug, Default)]
pub struct ServeOptions {
    pub port: Option<u16>,
    pub watch_dir: Option<PathBuf>,
    pub binary: Option<String>,
    pub no_watch: bool,
}

pub async fn cmd_serve(config_path: &Path, options: ServeOptions) -> Result<()> {
    let mut config = RelayConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.apply_env()?;
    if let Some(port) = options.port {
        config.server.port = port;
    }
    if let Some(dir) = options.watch_dir {
        config.watcher.dir = dir;
    }
    if let Some(binary) = options.binary {
        config.supervisor.binary = binary;
    }
    if options.no_watch {
        config.watcher.enabled = false;
    }
    config.ensure_valid()?;

    let supervisor = config
        .supervisor
        .enabled
        .then(|| Arc::new(ProcessSupervisor::new(config.supervisor_config())));
    let executor: Arc<dyn CommandExecutor> = match &supervisor {
        Some(supervisor) => {
            tokio::spawn(telemetry::log_supervisor_events(supervisor.subscribe()));
            supervisor.clone()
        }
        None => {
            tracing::warn!("command execution disabled by configuration");
            Arc::new(DisabledExecutor::new(
                config.supervisor.binary.clone(),
                "command execution is disabled (supervisor.enabled = false)",
            ))
        }
    };

    let server = BroadcastServer::new(config.server_config());
    let broadcaster = server.broadcaster();
    let server = server.with_routes(api::router(ApiState {
        executor,
        broadcaster: broadcaster.clone(),
    }));

    let watcher = config
        .watcher
        .enabled
        .then(|| DebouncedFileWatcher::new(config.watcher_config()));
    let forwarder = watcher.as_ref().map(|watcher| {
        let events = watcher.subscribe();
        watcher.start();
        tokio::spawn(forward_changes(events, broadcaster.clone()))
    });

    let addr = server
        .start(config.server.port)
        .await
        .context("Failed to start live server")?;
    println!("kanban-relay listening on http://{addr} (live channel ws://{addr}/ws)");
    if let Some(watcher) = &watcher {
        println!("Watching {}", watcher.dir().display());
    }

    super::shutdown_signal().await;

    if let Some(watcher) = &watcher {
        watcher.stop().await;
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    if let Some(supervisor) = &supervisor {
        let cancelled = supervisor.clear_queue("shutdown");
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled queued commands");
        }
    }
    server.stop().await;
    println!("Server shut down gracefully.");
    Ok(())
}

/// Turn settled file changes into `file:changed` broadcasts.
async fn forward_changes(mut events: broadcast::Receiver<WatchEvent>, broadcaster: Broadcaster) {
    loop {
        match events.recv().await {
            Ok(WatchEvent::Changed(change)) => {
                let path = change.path.display().to_string();
                let delivered = broadcaster.send(&Envelope::file_changed(&path));
                tracing::info!(
                    %path,
                    kind = ?change.kind,
                    coalesced = change.coalesced,
                    delivered,
                    "file change broadcast"
                );
            }
            // Already logged by the watcher; it keeps running.
            Ok(WatchEvent::Error(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "file change forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
