//! Error types for the Tidesync engine.

use crate::sync::TransportError;

/// Errors produced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `get_sync_engine()` was called before `configure_sync_engine()`,
    /// or after the engine was closed. Recoverable by configuring.
    #[error("sync engine has not been configured")]
    NotConfigured,

    /// The replica engine runtime has not been initialized.
    ///
    /// This is fatal for engine operations: no document state can be
    /// trusted without a replica engine behind it.
    #[error("replica engine not initialized; call init_replica_engine() first")]
    RuntimeNotReady,

    /// The engine or registry has been closed.
    #[error("sync engine is closed")]
    Closed,

    /// Invalid configuration supplied to `configure_sync_engine()`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The replica engine rejected an operation (decode/merge failure).
    #[error("replica error: {0}")]
    Replica(String),

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
