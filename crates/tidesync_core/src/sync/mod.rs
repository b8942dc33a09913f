//! Synchronization engine: connection lifecycle, document registry and
//! store binding.
//!
//! # Architecture
//!
//! ```text
//! application ──► StoreBinding ──► DocumentRegistry ──► ConnectionManager ──► Transport
//!      ▲                                 │ replica per document
//!      └── apply_patch ◄── notify ◄──────┘
//! ```
//!
//! Inbound: the transport delivers a binary frame, the connection manager
//! decodes the `ChangeEnvelope` and routes it into the registry, the
//! matching replica merges it, subscribers are notified, and bindings
//! replay the new state into application stores.

mod bootstrap;
mod connection;
mod engine;
mod envelope;
mod middleware;
mod registry;
mod replica;
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
mod tokio_transport;
mod transport;
mod types;

pub use bootstrap::{init_replica_engine, init_replica_engine_with, is_replica_engine_ready};
pub use connection::{ConnectionManager, MessageCallback, StatusCallback};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use engine::{configure_sync_engine, configure_sync_engine_with_status};
pub use engine::{
    EngineReadyCallback, OnlineCallback, SyncEngine, close_sync_engine,
    configure_sync_engine_with, get_sync_engine, on_sync_engine_ready,
};
pub use envelope::ChangeEnvelope;
pub use middleware::{ApplyPatch, StoreBinding};
pub use registry::{DocCallback, DocSubscription, DocumentRegistry, OutgoingSender};
pub use replica::{Draft, Replica, ReplicaFactory, YrsReplica, YrsReplicaFactory};
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use tokio_transport::{TokioConnector, TokioTransport};
pub use transport::{Connector, Transport, TransportError, WsMessage};
pub use types::{
    ChangeOrigin, ConnectionStatus, DocEvent, PeerId, ReconnectConfig, SyncEngineConfig,
};
