//! # `tidesync_core`
//!
//! Tidesync is a local-first state-synchronization engine: an application
//! keeps named documents that are mutated locally (optimistically, fully
//! offline-capable) and converge across peers over a WebSocket transport,
//! with no central authority for conflict resolution.
//!
//! The engine is the synchronization lifecycle layer. Conflict resolution
//! itself is delegated to a CRDT replica engine (`yrs` by default) behind
//! the narrow [`sync::Replica`] trait, and the wire channel is delegated to
//! a transport behind [`sync::Connector`] (tokio-tungstenite by default).
//!
//! # Quick start
//!
//! ```ignore
//! use tidesync_core::sync::{self, SyncEngineConfig};
//!
//! // Once per process, before anything else.
//! sync::init_replica_engine();
//!
//! let engine = sync::configure_sync_engine(SyncEngineConfig::new("wss://sync.example.com"))?;
//!
//! // Optimistic local mutation; visible immediately, synced when online.
//! engine.change("todo-list", |draft| {
//!     draft.set("title", serde_json::json!("groceries"));
//! })?;
//!
//! let _sub = engine.subscribe("todo-list", std::sync::Arc::new(|event| {
//!     println!("{} changed ({})", event.doc_id, event.origin);
//! }))?;
//! ```

#![warn(missing_docs)]

/// Error types.
pub mod error;

/// The synchronization engine.
pub mod sync;

/// Shared test infrastructure (in-memory transport hub).
pub mod test_utils;

pub use error::{Result, SyncError};
pub use sync::{SyncEngine, SyncEngineConfig, close_sync_engine, get_sync_engine, on_sync_engine_ready};

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use sync::configure_sync_engine;
