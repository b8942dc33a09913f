//! Transport abstraction for sync connections.
//!
//! This module defines the `Transport` trait, a thin duplex byte channel
//! over a WebSocket-shaped connection, and the `Connector` trait that
//! establishes such channels:
//!
//! - **Native (CLI, desktop)**: `TokioConnector` with tokio-tungstenite
//! - **Tests**: `test_utils::MemoryConnector` with in-process channels
//!
//! The connection manager owns a `Connector` and drives the returned
//! `Transport` from its run loop; everything above the manager sees only
//! `ChangeEnvelope`s and status transitions.

/// Errors produced by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A send on an established connection failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

/// A message received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    /// Binary frame (sync envelopes).
    Binary(Vec<u8>),
    /// Text frame. The engine exchanges no text messages; inbound text is
    /// tolerated and ignored.
    Text(String),
    /// Ping frame.
    Ping(Vec<u8>),
    /// Pong frame (keepalive response).
    Pong(Vec<u8>),
    /// The remote closed the connection.
    Close,
}

/// A duplex byte channel to a sync peer or relay.
///
/// Implementations must be `Send` so the connection manager can drive them
/// from its run-loop task.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Send a binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Send a keepalive ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Receive the next message. `None` means the channel is exhausted.
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    /// Close the channel gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Establishes transport channels. Object-safe so the connection manager
/// can hold any connector behind `Arc<dyn Connector>`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the given URL and return an established channel.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}
