//! Core types for the synchronization engine.
//!
//! This module defines the identifiers, configuration and notification
//! types shared by the connection manager, document registry and engine.

use serde::{Deserialize, Serialize};

/// Opaque identifier for this process, attached to every outgoing change.
///
/// Stable for the lifetime of one engine instance. Not persisted across
/// restarts unless the application supplies its own `client_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an externally supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random peer identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connectivity state of the connection manager.
///
/// `Closed` is terminal: once entered, no further transitions are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// A connection attempt is in flight.
    Connecting,
    /// The transport channel is open.
    Online,
    /// The transport channel is down; reconnection may be in progress.
    Offline,
    /// The manager was closed by the application. Terminal.
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Online => write!(f, "online"),
            ConnectionStatus::Offline => write!(f, "offline"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Origin of a document change, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Change originated from a local mutation.
    Local,
    /// Change received from a remote peer.
    Remote,
}

impl std::fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOrigin::Local => write!(f, "local"),
            ChangeOrigin::Remote => write!(f, "remote"),
        }
    }
}

/// Notification delivered to document subscribers on every change.
///
/// Subscribers pull the new state via `DocumentRegistry::snapshot()`; the
/// event itself only carries the document id and the origin tag.
#[derive(Debug, Clone)]
pub struct DocEvent {
    /// Identifier of the changed document.
    pub doc_id: String,
    /// Whether the change came from a local mutation or a remote peer.
    pub origin: ChangeOrigin,
}

/// Reconnection configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on disconnect.
    pub enabled: bool,
    /// Maximum number of reconnection attempts (0 = infinite).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff.
    pub base_delay_secs: u64,
    /// Maximum delay in seconds for exponential backoff.
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay_secs: 2,
            max_delay_secs: 32,
        }
    }
}

/// Configuration for the sync engine. Immutable once the engine is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineConfig {
    /// WebSocket server URL (e.g., "wss://sync.example.com/sync").
    pub url: String,
    /// Optional stable client identity. A random one is generated if absent.
    pub client_id: Option<String>,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
}

impl SyncEngineConfig {
    /// Create a configuration for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Set a stable client identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the reconnection configuration.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate the configuration.
    ///
    /// The URL must parse and carry a `ws` or `wss` scheme.
    pub fn validate(&self) -> crate::error::Result<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| crate::error::SyncError::Config(format!("invalid url: {}", e)))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(crate::error::SyncError::Config(format!(
                "unsupported url scheme '{}' (expected ws or wss)",
                other
            ))),
        }
    }

    /// Resolve the peer identity: the supplied `client_id` or a random one.
    pub fn peer_id(&self) -> PeerId {
        match &self.client_id {
            Some(id) => PeerId::new(id.clone()),
            None => PeerId::generate(),
        }
    }
}
