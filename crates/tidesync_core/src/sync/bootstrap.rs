//! Process-wide replica engine bootstrap.
//!
//! Before any engine operation, the replica engine must be initialized
//! exactly once per process by installing a `ReplicaFactory`. The engine
//! fails fast with `SyncError::RuntimeNotReady` if configuration is
//! attempted first: no document operation can be trusted without a replica
//! engine behind it.
//!
//! `init_replica_engine()` installs the default `yrs`-backed factory;
//! applications embedding a different CRDT engine install their own via
//! `init_replica_engine_with()`. The first installation wins; later calls
//! are no-ops.

use std::sync::{Arc, OnceLock};

use super::replica::{ReplicaFactory, YrsReplicaFactory};
use crate::error::{Result, SyncError};

static FACTORY: OnceLock<Arc<dyn ReplicaFactory>> = OnceLock::new();

/// Initialize the replica engine with the default `yrs` backend.
///
/// Idempotent: calling again (or after `init_replica_engine_with`) has no
/// effect beyond a diagnostic.
pub fn init_replica_engine() {
    init_replica_engine_with(Arc::new(YrsReplicaFactory));
}

/// Initialize the replica engine with a custom factory.
pub fn init_replica_engine_with(factory: Arc<dyn ReplicaFactory>) {
    if FACTORY.set(factory).is_err() {
        log::debug!("[Bootstrap] replica engine already initialized, ignoring");
    } else {
        log::info!("[Bootstrap] replica engine initialized");
    }
}

/// Whether the replica engine has been initialized.
pub fn is_replica_engine_ready() -> bool {
    FACTORY.get().is_some()
}

/// The installed factory, or `RuntimeNotReady` if bootstrap never ran.
pub(crate) fn replica_factory() -> Result<Arc<dyn ReplicaFactory>> {
    FACTORY.get().cloned().ok_or(SyncError::RuntimeNotReady)
}
