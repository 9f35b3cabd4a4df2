//! `kanban-relay tail`: print live channel envelopes.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::{broadcast, mpsc};

use kanban_relay::live::{ClientEvent, Envelope, EnvelopeHandler, ReconnectingClient, WILDCARD};
use kanban_relay::relay_config::RelayConfig;

pub async fn cmd_tail(config_path: &Path, url: Option<&str>, kinds: &[String]) -> Result<()> {
    let mut config = RelayConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.apply_env()?;
    config.ensure_valid()?;

    let client = ReconnectingClient::new(config.client_config(url));
    let (tx, mut envelopes) = mpsc::unbounded_channel::<Envelope>();
    let handler: EnvelopeHandler = Arc::new(move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    if kinds.is_empty() {
        client.on(WILDCARD, handler);
    } else {
        for kind in kinds {
            client.on(kind, Arc::clone(&handler));
        }
    }

    let mut events = client.subscribe();
    client.connect();
    tracing::info!(url = %client.url(), "tailing live channel");

    let shutdown = super::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(envelope) = envelopes.recv() => {
                println!("{}", envelope.to_json()?);
            }
            event = events.recv() => match event {
                Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                    client.disconnect().await;
                    bail!("Gave up on {} after {} reconnect attempts", client.url(), attempts);
                }
                Ok(ClientEvent::Connected) => eprintln!("connected to {}", client.url()),
                Ok(ClientEvent::Disconnected) => eprintln!("disconnected, reconnecting..."),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
