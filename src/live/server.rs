//! WebSocket fan-out server.
//!
//! Every accepted socket gets a bounded outbound queue. `broadcast`
//! serializes the envelope once and `try_send`s it to each client whose
//! readiness is `Open`, so a slow or half-closed peer is skipped rather
//! than awaited.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use super::envelope::Envelope;
use crate::errors::ServerError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before the client is considered dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Outbound frames buffered per client before new broadcasts are
    /// dropped for that client.
    pub channel_capacity: usize,
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            channel_capacity: 256,
            permissive_cors: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events observable by the host process.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A well-formed envelope arrived from a client.
    Message { client_id: Uuid, envelope: Envelope },
    ClientConnected { client_id: Uuid },
    ClientDisconnected { client_id: Uuid },
    /// One connection failed; the server and other clients are unaffected.
    ClientError { client_id: Uuid, message: String },
    /// The server itself failed after a successful bind.
    Error { message: String },
}

struct ClientHandle {
    state: ReadyState,
    outbound: mpsc::Sender<Utf8Bytes>,
}

/// Live-connection set shared by the socket tasks and every `Broadcaster`.
pub(crate) struct Hub {
    clients: Mutex<HashMap<Uuid, ClientHandle>>,
    events: broadcast::Sender<ServerEvent>,
    capacity: usize,
}

impl Hub {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            clients: Mutex::new(HashMap::new()),
            events,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (Uuid, mpsc::Receiver<Utf8Bytes>) {
        let id = Uuid::new_v4();
        let (outbound, rx) = mpsc::channel(self.capacity);
        self.lock().insert(
            id,
            ClientHandle {
                state: ReadyState::Connecting,
                outbound,
            },
        );
        (id, rx)
    }

    fn set_state(&self, id: Uuid, state: ReadyState) {
        if let Some(client) = self.lock().get_mut(&id) {
            client.state = state;
        }
    }

    fn unregister(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    fn close_all(&self) {
        for client in self.lock().values_mut() {
            client.state = ReadyState::Closed;
        }
    }

    fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn broadcast_text(&self, text: Utf8Bytes) -> usize {
        let mut delivered = 0;
        for (id, client) in self.lock().iter_mut() {
            if client.state != ReadyState::Open {
                continue;
            }
            match client.outbound.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(client_id = %id, "client outbound buffer full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => client.state = ReadyState::Closed,
            }
        }
        delivered
    }
}

/// Cheap, clonable handle for publishing envelopes to every open client.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<Hub>,
}

impl Broadcaster {
    /// Returns the number of clients the frame was queued for.
    pub fn broadcast(&self, kind: &str, payload: Value) -> usize {
        self.send(&Envelope::new(kind, payload))
    }

    pub fn send(&self, envelope: &Envelope) -> usize {
        match envelope.to_json() {
            Ok(json) => {
                let delivered = self.hub.broadcast_text(Utf8Bytes::from(json));
                tracing::debug!(kind = %envelope.kind, delivered, "broadcast envelope");
                delivered
            }
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, error = %e, "failed to serialize envelope");
                0
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    serve: JoinHandle<()>,
    tracker: TaskTracker,
}

#[derive(Clone)]
struct SocketContext {
    hub: Arc<Hub>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

pub struct BroadcastServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    routes: Router,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl BroadcastServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(Hub::new(config.channel_capacity));
        Self {
            config,
            hub,
            routes: Router::new(),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Serve additional HTTP routes on the same listener as `/ws`.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            hub: Arc::clone(&self.hub),
        }
    }

    pub fn broadcast(&self, kind: &str, payload: Value) -> usize {
        self.broadcaster().broadcast(kind, payload)
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.hub.events.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Bind and start serving. Port 0 picks an ephemeral port; the bound
    /// address is returned.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(ServerError::AlreadyRunning { addr: current.addr });
        }

        let bind_addr = format!("{}:{}", self.config.host, port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let context = SocketContext {
            hub: Arc::clone(&self.hub),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        };

        let mut app = self
            .routes
            .clone()
            .merge(Router::new().route("/ws", get(ws_handler)).with_state(context));
        if self.config.permissive_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let hub = Arc::clone(&self.hub);
        let shutdown = cancel.clone().cancelled_owned();
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "live server failed");
                hub.emit(ServerEvent::Error {
                    message: e.to_string(),
                });
            }
        });

        tracing::info!(%addr, "live server listening");
        *running = Some(Running {
            addr,
            cancel,
            serve,
            tracker,
        });
        Ok(addr)
    }

    /// Close every client and stop accepting connections. Resolves once
    /// all socket tasks have finished.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.hub.close_all();
        running.cancel.cancel();
        if let Err(e) = running.serve.await {
            tracing::warn!(error = %e, "live server task ended abnormally");
        }
        running.tracker.close();
        running.tracker.wait().await;
        tracing::info!(addr = %running.addr, "live server stopped");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<SocketContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let SocketContext {
            hub,
            tracker,
            cancel,
        } = context;
        tracker.track_future(handle_socket(socket, hub, cancel))
    })
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, cancel: CancellationToken) {
    let (id, outbound) = hub.register();
    hub.set_state(id, ReadyState::Open);
    tracing::info!(client_id = %id, clients = hub.client_count(), "live client connected");
    hub.emit(ServerEvent::ClientConnected { client_id: id });

    let (sender, receiver) = socket.split();
    run_socket_loop(id, sender, receiver, outbound, &hub, cancel).await;

    hub.unregister(id);
    tracing::info!(client_id = %id, clients = hub.client_count(), "live client disconnected");
    hub.emit(ServerEvent::ClientDisconnected { client_id: id });
}

/// Pong bookkeeping for one client. While a ping is outstanding the client
/// must answer within `PONG_TIMEOUT` of its last pong (or of connecting).
#[derive(Debug)]
struct Keepalive {
    last_pong: Instant,
    awaiting: bool,
}

impl Keepalive {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            awaiting: false,
        }
    }

    fn on_ping_sent(&mut self) {
        self.awaiting = true;
    }

    fn on_pong(&mut self) {
        self.last_pong = Instant::now();
        self.awaiting = false;
    }

    /// When the client is declared dead, if a ping is outstanding.
    fn deadline(&self) -> Option<Instant> {
        self.awaiting.then(|| self.last_pong + PONG_TIMEOUT)
    }
}

/// Outbound forwarding, inbound parsing and ping/pong keepalive for one
/// client. Returns when the peer goes away, stops answering pings, or the
/// server shuts down.
async fn run_socket_loop(
    id: Uuid,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    hub: &Hub,
    cancel: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut keepalive = Keepalive::new();

    loop {
        let pong_deadline = keepalive.deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
                if pong_deadline.is_some() =>
            {
                tracing::info!(client_id = %id, "no pong within timeout, dropping client");
                break;
            }

            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                keepalive.on_ping_sent();
            }

            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    report_client_error(hub, id, e.to_string());
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::parse(text.as_str()) {
                            Some(envelope) => hub.emit(ServerEvent::Message { client_id: id, envelope }),
                            None => tracing::debug!(client_id = %id, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => keepalive.on_pong(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        report_client_error(hub, id, e.to_string());
                        break;
                    }
                }
            }
        }
    }

    hub.set_state(id, ReadyState::Closing);
    let _ = sender.send(Message::Close(None)).await;
    hub.set_state(id, ReadyState::Closed);
}

fn report_client_error(hub: &Hub, id: Uuid, message: String) {
    tracing::warn!(client_id = %id, error = %message, "live client error");
    hub.emit(ServerEvent::ClientError {
        client_id: id,
        message,
    });
}
