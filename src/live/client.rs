//! Reconnecting WebSocket client for the live channel.
//!
//! Unexpected drops are retried with exponential backoff; an explicit
//! `disconnect` cancels any pending retry and nothing reconnects after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;
use crate::errors::ClientError;

/// Handler key that receives every envelope regardless of type.
pub const WILDCARD: &str = "*";

const EVENT_CAPACITY: usize = 64;

pub type EnvelopeHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3142/ws".to_string(),
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub current_delay: Duration,
    pub intentional_disconnect: bool,
}

impl ReconnectState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            attempts: 0,
            current_delay: config.reconnect_delay,
            intentional_disconnect: false,
        }
    }

    /// Back to baseline after a successful open.
    pub fn reset(&mut self, config: &ClientConfig) {
        self.attempts = 0;
        self.current_delay = config.reconnect_delay;
    }

    /// Delay before the next reconnect, or `None` once attempts are
    /// exhausted. Doubles the following delay up to the configured cap.
    pub fn schedule(&mut self, config: &ClientConfig) -> Option<Duration> {
        if let Some(max) = config.max_reconnect_attempts
            && self.attempts >= max
        {
            return None;
        }
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(config.max_reconnect_delay);
        self.attempts += 1;
        Some(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected,
    Disconnected,
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    ReconnectExhausted { attempts: u32 },
    Error { message: String },
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ReconnectState>,
    connected: AtomicBool,
    handlers: Mutex<HashMap<String, Vec<EnvelopeHandler>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: broadcast::Sender<ClientEvent>,
    driver: Mutex<Option<Driver>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<Inner>,
}

impl ReconnectingClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ReconnectState::new(&config)),
                config,
                connected: AtomicBool::new(false),
                handlers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                events,
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Start connecting in the background. Returns `false` if a connection
    /// loop is already running.
    pub fn connect(&self) -> bool {
        let mut driver = lock(&self.inner.driver);
        if let Some(current) = driver.as_ref()
            && !current.task.is_finished()
        {
            return false;
        }

        {
            let mut state = lock(&self.inner.state);
            state.intentional_disconnect = false;
            state.reset(&self.inner.config);
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(Arc::clone(&self.inner), cancel.clone()));
        *driver = Some(Driver { cancel, task });
        true
    }

    /// Close the live connection and cancel any scheduled reconnect.
    pub async fn disconnect(&self) {
        lock(&self.inner.state).intentional_disconnect = true;
        let driver = lock(&self.inner.driver).take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Err(e) = driver.task.await {
                tracing::warn!(error = %e, "live client task ended abnormally");
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        lock(&self.inner.outbound).take();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        lock(&self.inner.state).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Register `handler` for envelopes of `kind` (or [`WILDCARD`]).
    /// Registering the same handler twice has no further effect.
    pub fn on(&self, kind: &str, handler: EnvelopeHandler) {
        let mut handlers = lock(&self.inner.handlers);
        let entry = handlers.entry(kind.to_string()).or_default();
        if !entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            entry.push(handler);
        }
    }

    /// Remove a handler; returns whether it was registered.
    pub fn off(&self, kind: &str, handler: &EnvelopeHandler) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let Some(entry) = handlers.get_mut(kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = entry.len() != before;
        if entry.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let json = envelope.to_json()?;
        let outbound = lock(&self.inner.outbound);
        let not_connected = || ClientError::NotConnected {
            url: self.inner.config.url.clone(),
        };
        outbound
            .as_ref()
            .ok_or_else(not_connected)?
            .send(json)
            .map_err(|_| not_connected())
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn intentional(&self) -> bool {
        lock(&self.state).intentional_disconnect
    }

    fn dispatch(&self, text: &str) {
        let Some(envelope) = Envelope::parse(text) else {
            tracing::debug!("ignoring malformed frame");
            return;
        };
        // Snapshot so handlers may call on/off without deadlocking.
        let matched: Vec<EnvelopeHandler> = {
            let handlers = lock(&self.handlers);
            handlers
                .get(&envelope.kind)
                .into_iter()
                .chain(handlers.get(WILDCARD))
                .flatten()
                .cloned()
                .collect()
        };
        for handler in matched {
            handler(&envelope);
        }
    }

    async fn run_connection(
        &self,
        socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut rx: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        self.report_error(e.to_string());
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the protocol layer on the next read.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.report_error(e.to_string());
                        break;
                    }
                },
            }
        }

        lock(&self.outbound).take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn report_error(&self, message: String) {
        tracing::warn!(url = %self.config.url, error = %message, "live connection error");
        self.emit(ClientEvent::Error { message });
    }
}

async fn drive(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_async(inner.config.url.as_str()) => result,
        };

        match attempt {
            Ok((socket, _)) => {
                lock(&inner.state).reset(&inner.config);
                // Installed before `Connected` so `send` works as soon as
                // subscribers hear about it.
                let (tx, rx) = mpsc::unbounded_channel::<String>();
                *lock(&inner.outbound) = Some(tx);
                inner.connected.store(true, Ordering::SeqCst);
                tracing::info!(url = %inner.config.url, "live connection open");
                inner.emit(ClientEvent::Connected);

                inner.run_connection(socket, rx, &cancel).await;

                if cancel.is_cancelled() || inner.intentional() {
                    return;
                }
                tracing::info!(url = %inner.config.url, "live connection dropped");
                inner.emit(ClientEvent::Disconnected);
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                inner.report_error(
                    ClientError::Connection {
                        url: inner.config.url.clone(),
                        message: e.to_string(),
                    }
                    .to_string(),
                );
            }
        }

        let (next, attempts) = {
            let mut state = lock(&inner.state);
            (state.schedule(&inner.config), state.attempts)
        };
        let Some(delay) = next else {
            tracing::warn!(url = %inner.config.url, attempts, "giving up on reconnect");
            inner.emit(ClientEvent::ReconnectExhausted { attempts });
            return;
        };

        let delay_ms = delay.as_millis() as u64;
        tracing::info!(url = %inner.config.url, attempt = attempts, delay_ms, "reconnect scheduled");
        inner.emit(ClientEvent::ReconnectScheduled {
            attempt: attempts,
            delay_ms,
        });
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn config(url: &str, base_ms: u64, max_ms: u64, attempts: Option<u32>) -> ClientConfig {
        ClientConfig {
            url: url.to_string(),
            reconnect_delay: Duration::from_millis(base_ms),
            max_reconnect_delay: Duration::from_millis(max_ms),
            max_reconnect_attempts: attempts,
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = config("ws://unused", 1000, 30_000, None);
        let mut state = ReconnectState::new(&config);
        let delays: Vec<u64> = (0..7)
            .map(|_| state.schedule(&config).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(state.attempts, 7);
    }

    #[test]
    fn attempts_are_capped() {
        let config = config("ws://unused", 10, 100, Some(3));
        let mut state = ReconnectState::new(&config);
        assert!(state.schedule(&config).is_some());
        assert!(state.schedule(&config).is_some());
        assert!(state.schedule(&config).is_some());
        assert_eq!(state.schedule(&config), None);
        assert_eq!(state.attempts, 3);

        state.reset(&config);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.current_delay, Duration::from_millis(10));
    }

    #[test]
    fn handler_registration_is_idempotent() {
        let client = ReconnectingClient::new(ClientConfig::default());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler: EnvelopeHandler = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        client.on("file:changed", Arc::clone(&handler));
        client.on("file:changed", Arc::clone(&handler));
        client.inner.dispatch(r#"{"type":"file:changed","payload":{"path":"a"}}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        client.inner.dispatch(r#"{"type":"issues:changed"}"#);
        client.inner.dispatch("not json");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(client.off("file:changed", &handler));
        assert!(!client.off("file:changed", &handler));
        assert!(!client.off("never-registered", &handler));
        client.inner.dispatch(r#"{"type":"file:changed"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_receives_everything() {
        let client = ReconnectingClient::new(ClientConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: EnvelopeHandler = {
            let seen = Arc::clone(&seen);
            Arc::new(move |envelope| seen.lock().unwrap().push(envelope.kind.clone()))
        };
        client.on(WILDCARD, handler);
        client.inner.dispatch(r#"{"type":"a"}"#);
        client.inner.dispatch(r#"{"type":"b"}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn send_without_connection_fails() {
        let client = ReconnectingClient::new(ClientConfig::default());
        let err = client
            .send(&Envelope::new("hello", serde_json::Value::Null))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_attempts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ReconnectingClient::new(config(
            &format!("ws://127.0.0.1:{port}/ws"),
            10,
            25,
            Some(3),
        ));
        let mut events = client.subscribe();
        assert!(client.connect());

        let mut delays = Vec::new();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
                ClientEvent::ReconnectScheduled { delay_ms, .. } => delays.push(delay_ms),
                ClientEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                ClientEvent::Error { .. } => {}
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert_eq!(delays, vec![10, 20, 25]);
        assert!(!client.is_connected());

        // A fresh connect after exhaustion starts over from the baseline.
        assert!(client.connect());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ReconnectingClient::new(config(
            &format!("ws://127.0.0.1:{port}/ws"),
            5_000,
            10_000,
            None,
        ));
        let mut events = client.subscribe();
        client.connect();
        loop {
            if let ClientEvent::ReconnectScheduled { .. } =
                timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
            {
                break;
            }
        }

        // The 5s backoff sleep must not delay disconnect.
        timeout(Duration::from_secs(1), client.disconnect()).await.unwrap();
        assert!(client.reconnect_state().intentional_disconnect);
        assert!(!client.is_connected());
    }
}
