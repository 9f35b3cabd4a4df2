//! Single-timer debounce loop.
//!
//! Every qualifying notification pushes one shared deadline out to
//! `now + window`; when the deadline passes undisturbed, exactly one
//! `Changed` event is published for the whole burst.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{FileChangeEvent, WatchEvent};
use crate::errors::WatchError;

/// Input to the debounce loop from the native watcher callback.
#[derive(Debug)]
pub(crate) enum WatchSignal {
    Change(FileChangeEvent),
    Failed(WatchError),
}

pub(crate) async fn debounce_loop(
    mut signals: mpsc::UnboundedReceiver<WatchSignal>,
    window: Duration,
    events: broadcast::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let mut pending: Option<FileChangeEvent> = None;
    let mut coalesced = 0usize;
    let timer = tokio::time::sleep(window);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(WatchSignal::Change(event)) => {
                    coalesced += 1;
                    pending = Some(event);
                    timer.as_mut().reset(Instant::now() + window);
                }
                Some(WatchSignal::Failed(err)) => {
                    tracing::warn!(error = %err, "file watcher error");
                    let _ = events.send(WatchEvent::Error(Arc::new(err)));
                }
                None => break,
            },
            _ = &mut timer, if pending.is_some() => {
                if let Some(mut event) = pending.take() {
                    event.coalesced = coalesced;
                    coalesced = 0;
                    tracing::debug!(
                        path = %event.path.display(),
                        kind = ?event.kind,
                        coalesced = event.coalesced,
                        "file change settled"
                    );
                    let _ = events.send(WatchEvent::Changed(event));
                }
            }
        }
    }
}
