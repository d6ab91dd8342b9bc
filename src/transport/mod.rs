//! Channel abstraction for the push-notification hub.
//!
//! The engine only ever sees these traits; the concrete SignalR client lives
//! in [`signalr`].
//!
//! # Architecture
//!
//! ```text
//! Transport::connect(url, token)
//!     │
//!     ├── Box<dyn ChannelHandle>      invoke(method, args) / close()
//!     │
//!     └── mpsc::UnboundedReceiver<ChannelEvent>
//!             Invocation { target, arguments }   (in arrival order)
//!             Closed { error }                   (always last)
//! ```
//!
//! Inbound traffic arrives through one serialized queue instead of per-event
//! callbacks, so consumers see hub events strictly in the order the channel
//! received them. A `Closed` event is the channel's state-change signal.
//!
//! The queue is unbounded: the socket task must keep answering pings and
//! completions even while nobody drains notifications.

// Rust guideline compliant 2026-02

pub mod signalr;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use signalr::SignalRTransport;

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The hub invoked a client method.
    Invocation {
        /// Hub event name (e.g. "ReceiveNotification").
        target: String,
        /// Positional arguments.
        arguments: Vec<serde_json::Value>,
    },
    /// The channel is gone. No further events follow.
    Closed {
        /// Why, if known. `None` for a clean close.
        error: Option<String>,
    },
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Network or WebSocket handshake failure.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server refused the credentials (HTTP 401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The hub protocol handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The hub returned an error for an invocation.
    #[error("invocation failed: {0}")]
    Invoke(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// Channel was closed.
    #[error("channel closed")]
    Closed,
}

/// An open channel: the outbound handle plus the inbound event queue.
pub struct Connection {
    /// Outbound operations.
    pub handle: Box<dyn ChannelHandle>,
    /// Inbound events in arrival order.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens channels to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `url`, authenticating with `access_token`.
    ///
    /// The token is passed per call so a rotated token is used on reconnect.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when the server rejects the token, `Connect` or
    /// `Handshake` for anything else that stops the channel opening.
    async fn connect(&self, url: &str, access_token: &str) -> Result<Connection, TransportError>;
}

/// Outbound half of an open channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Invoke a hub method and wait for its completion.
    async fn invoke(
        &self,
        method: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}
