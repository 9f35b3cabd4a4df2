//! Logging setup and the supervisor event sink.

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::supervisor::SupervisorEvent;

const DEFAULT_FILTER: &str = "kanban_relay=info";
const VERBOSE_FILTER: &str = "kanban_relay=debug";

/// Install the global subscriber. `RUST_LOG` wins over `verbose`. Logs go
/// to stderr so stdout stays clean for `tail` output.
pub fn init_logging(verbose: bool, json: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding) is not an error worth surfacing.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).compact().try_init()
    };
}

/// Forward supervisor events into the log until the channel closes.
pub async fn log_supervisor_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "supervisor event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &SupervisorEvent) {
    match event {
        // The breaker logs the transition itself at info/warn.
        SupervisorEvent::StateChange {
            previous,
            next,
            consecutive_failures,
        } => tracing::debug!(
            %previous,
            %next,
            consecutive_failures,
            "circuit breaker state changed"
        ),
        SupervisorEvent::CommandQueued { binary, queued } => {
            tracing::debug!(%binary, queued, "command queued")
        }
        SupervisorEvent::QueueCleared { reason, cancelled } => {
            tracing::info!(%reason, cancelled, "command queue cleared")
        }
        SupervisorEvent::CommandStarted { .. } | SupervisorEvent::CommandFinished { .. } => {
            tracing::trace!(event = ?event, "supervisor event")
        }
    }
}
