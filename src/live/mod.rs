//! Live-update channel: JSON envelopes over WebSocket.
//!
//! `BroadcastServer` fans envelopes out to every open connection;
//! `ReconnectingClient` is the consuming side and keeps itself connected.

pub mod client;
pub mod envelope;
pub mod server;

pub use client::{ClientConfig, ClientEvent, EnvelopeHandler, ReconnectState, ReconnectingClient, WILDCARD};
pub use envelope::{Envelope, FILE_CHANGED, ISSUES_CHANGED};
pub use server::{BroadcastServer, Broadcaster, ReadyState, ServerConfig, ServerEvent};
