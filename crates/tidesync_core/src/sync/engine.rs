//! Engine composition root and process-wide lifecycle singleton.
//!
//! A `SyncEngine` owns exactly one `ConnectionManager` and one
//! `DocumentRegistry` and wires them together: inbound envelopes route into
//! the registry, registry change sets flow out through the connection.
//!
//! The free functions implement "configure once, fetch anywhere":
//! `configure_sync_engine*()` installs the process-wide instance (closing
//! any previous one first, so no two live transports exist),
//! `get_sync_engine()` returns it, `close_sync_engine()` tears it down.
//! Components that start before configuration register with
//! `on_sync_engine_ready()` and are called back the moment an engine
//! becomes available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::bootstrap;
use super::connection::{ConnectionManager, MessageCallback, StatusCallback};
use super::registry::{DocCallback, DocSubscription, DocumentRegistry};
use super::replica::{Draft, Replica};
use super::transport::Connector;
use super::types::{ConnectionStatus, PeerId, SyncEngineConfig};
use crate::error::{Result, SyncError};

/// Callback type for the boolean online/offline surface.
pub type OnlineCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Callback invoked once when an engine becomes available.
pub type EngineReadyCallback = Box<dyn FnOnce(Arc<SyncEngine>) + Send>;

/// The process-wide engine slot and the pending-ready callbacks.
static ENGINE_SLOT: Mutex<Option<Arc<SyncEngine>>> = Mutex::new(None);
static READY_CALLBACKS: Mutex<Vec<EngineReadyCallback>> = Mutex::new(Vec::new());

/// Top-level composition root: one connection, one document registry.
pub struct SyncEngine {
    config: SyncEngineConfig,
    connection: Arc<ConnectionManager>,
    registry: Arc<DocumentRegistry>,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Build an engine instance without touching the process-wide slot.
    ///
    /// Must be called from within a tokio runtime: the connection manager
    /// spawns its run loop immediately. Most applications use
    /// `configure_sync_engine()` instead; direct construction exists for
    /// hosts embedding several engines (and for tests).
    pub fn open(
        config: SyncEngineConfig,
        connector: Arc<dyn Connector>,
        on_online: Option<OnlineCallback>,
    ) -> Result<Arc<Self>> {
        let factory = bootstrap::replica_factory()?;
        config.validate()?;

        let on_status = on_online.map(online_status_adapter);
        let connection = ConnectionManager::open(&config, connector, on_status);

        let registry = Arc::new(DocumentRegistry::new(
            connection.peer_id().clone(),
            factory,
        ));

        // Inbound: envelopes from the connection merge into the registry.
        let inbound: MessageCallback = {
            let registry = Arc::clone(&registry);
            Arc::new(move |envelope| {
                let doc_id = envelope.doc_id.clone();
                if let Err(e) = registry.apply_remote(&envelope) {
                    log::warn!("[SyncEngine] failed to apply remote change for '{}': {}", doc_id, e);
                }
            })
        };
        connection.set_on_message(inbound);

        // Outgoing: registry change sets enqueue on the connection.
        {
            let connection = Arc::clone(&connection);
            registry.set_outgoing(Arc::new(move |envelope| {
                connection.send(envelope);
            }));
        }

        log::info!(
            "[SyncEngine] engine opened for {} as peer {}",
            config.url,
            connection.peer_id()
        );

        Ok(Arc::new(Self {
            config,
            connection,
            registry,
            closed: AtomicBool::new(false),
        }))
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// This engine's peer identity.
    pub fn peer_id(&self) -> &PeerId {
        self.connection.peer_id()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// The document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// The connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Open a document handle, creating it on first access.
    pub fn document(&self, id: &str) -> Result<Arc<dyn Replica>> {
        self.registry.open(id)
    }

    /// Apply a local mutation to a document.
    pub fn change<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Draft),
    {
        self.registry.mutate(id, f)
    }

    /// Subscribe to a document's change notifications.
    pub fn subscribe(&self, id: &str, callback: DocCallback) -> Result<DocSubscription> {
        self.registry.subscribe(id, callback)
    }

    /// Current state of a document, or `None` if it was never opened.
    pub fn snapshot(&self, id: &str) -> Option<serde_json::Value> {
        self.registry.snapshot(id)
    }

    /// Close the engine: registry first, then the connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.close();
        self.connection.close();
        log::info!("[SyncEngine] engine closed");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("url", &self.config.url)
            .field("peer_id", self.peer_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Adapt the full status stream to the boolean online/offline surface.
///
/// Only `Online`/`Offline` transitions are forwarded, deduplicated so the
/// consumer sees each flip exactly once. `Connecting` and `Closed` are not
/// surfaced here.
fn online_status_adapter(on_online: OnlineCallback) -> StatusCallback {
    let last_sent: Mutex<Option<bool>> = Mutex::new(None);
    Arc::new(move |status| {
        let online = match status {
            ConnectionStatus::Online => true,
            ConnectionStatus::Offline => false,
            ConnectionStatus::Connecting | ConnectionStatus::Closed => return,
        };
        {
            let mut last = last_sent.lock().unwrap();
            if *last == Some(online) {
                return;
            }
            *last = Some(online);
        }
        on_online(online);
    })
}

/// Configure the process-wide engine with the default WebSocket transport.
///
/// If an engine with the same configuration is already installed it is
/// returned as-is; a differing configuration closes and replaces the
/// previous instance before the new one is opened.
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub fn configure_sync_engine(config: SyncEngineConfig) -> Result<Arc<SyncEngine>> {
    configure_sync_engine_with(config, Arc::new(super::tokio_transport::TokioConnector), None)
}

/// Configure the process-wide engine with the default transport and an
/// online/offline status callback.
#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub fn configure_sync_engine_with_status(
    config: SyncEngineConfig,
    on_online: OnlineCallback,
) -> Result<Arc<SyncEngine>> {
    configure_sync_engine_with(
        config,
        Arc::new(super::tokio_transport::TokioConnector),
        Some(on_online),
    )
}

/// Configure the process-wide engine with a custom transport connector.
///
/// Pending `on_sync_engine_ready()` callbacks are drained and cleared
/// atomically with the slot installation, then invoked with the new engine.
pub fn configure_sync_engine_with(
    config: SyncEngineConfig,
    connector: Arc<dyn Connector>,
    on_online: Option<OnlineCallback>,
) -> Result<Arc<SyncEngine>> {
    let (engine, pending) = {
        let mut slot = ENGINE_SLOT.lock().unwrap();

        if let Some(existing) = slot.as_ref() {
            if existing.config() == &config {
                return Ok(Arc::clone(existing));
            }
            log::info!("[SyncEngine] configuration changed, replacing engine");
            existing.close();
            *slot = None;
        }

        let engine = SyncEngine::open(config, connector, on_online)?;
        *slot = Some(Arc::clone(&engine));

        let pending: Vec<EngineReadyCallback> = {
            let mut callbacks = READY_CALLBACKS.lock().unwrap();
            std::mem::take(&mut *callbacks)
        };
        (engine, pending)
    };

    // Invoked outside the slot lock so a callback may call get_sync_engine().
    for callback in pending {
        callback(Arc::clone(&engine));
    }
    Ok(engine)
}

/// The current process-wide engine.
pub fn get_sync_engine() -> Result<Arc<SyncEngine>> {
    ENGINE_SLOT
        .lock()
        .unwrap()
        .clone()
        .ok_or(SyncError::NotConfigured)
}

/// Close the process-wide engine and clear the slot. No-op when nothing is
/// configured.
pub fn close_sync_engine() {
    let engine = ENGINE_SLOT.lock().unwrap().take();
    if let Some(engine) = engine {
        engine.close();
    }
}

/// Run `callback` once an engine is available.
///
/// Fires immediately when an engine is already configured; otherwise the
/// callback is queued and drained by the next successful configure.
pub fn on_sync_engine_ready(callback: impl FnOnce(Arc<SyncEngine>) + Send + 'static) {
    let slot = ENGINE_SLOT.lock().unwrap();
    match slot.as_ref() {
        Some(engine) => {
            let engine = Arc::clone(engine);
            drop(slot);
            callback(engine);
        }
        None => {
            READY_CALLBACKS.lock().unwrap().push(Box::new(callback));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::bootstrap::init_replica_engine;
    use crate::test_utils::MemoryHub;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        init_replica_engine();
        let hub = MemoryHub::new();
        let err = SyncEngine::open(
            SyncEngineConfig::new("http://not-a-ws-url"),
            Arc::new(hub.connector()),
            None,
        );
        assert!(matches!(err, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_change_and_snapshot() {
        init_replica_engine();
        let hub = MemoryHub::new();
        let engine = SyncEngine::open(
            SyncEngineConfig::new("ws://test.invalid/sync"),
            Arc::new(hub.connector()),
            None,
        )
        .unwrap();

        engine.change("doc1", |draft| draft.set("x", json!(1))).unwrap();
        assert_eq!(engine.snapshot("doc1").unwrap()["x"], json!(1));
        engine.close();
    }

    #[tokio::test]
    async fn test_online_callback_sequence() {
        init_replica_engine();
        let hub = MemoryHub::new();
        let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

        let config = SyncEngineConfig::new("ws://test.invalid/sync").with_reconnect(
            crate::sync::ReconnectConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let engine = SyncEngine::open(config, Arc::new(hub.connector()), Some({
            let seen = Arc::clone(&seen);
            Arc::new(move |online| seen.lock().unwrap().push(online))
        }))
        .unwrap();

        wait_for(|| engine.status() == ConnectionStatus::Online).await;
        hub.disconnect_all();
        wait_for(|| engine.status() == ConnectionStatus::Offline).await;
        engine.close();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_online_adapter_dedupes() {
        let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let adapter = online_status_adapter({
            let seen = Arc::clone(&seen);
            Arc::new(move |online| seen.lock().unwrap().push(online))
        });

        adapter(ConnectionStatus::Connecting);
        adapter(ConnectionStatus::Online);
        adapter(ConnectionStatus::Online);
        adapter(ConnectionStatus::Offline);
        adapter(ConnectionStatus::Connecting);
        adapter(ConnectionStatus::Offline);
        adapter(ConnectionStatus::Closed);

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    // The singleton slot is process-wide, so the whole configure/get/close
    // lifecycle runs in a single sequential test.
    #[tokio::test]
    async fn test_singleton_lifecycle() {
        init_replica_engine();
        let hub = MemoryHub::new();

        // Not configured yet.
        close_sync_engine(); // no-op on empty slot
        assert!(matches!(get_sync_engine(), Err(SyncError::NotConfigured)));

        // A component starting before configuration.
        let ready_count = Arc::new(AtomicUsize::new(0));
        {
            let ready_count = Arc::clone(&ready_count);
            on_sync_engine_ready(move |engine| {
                // The slot must already be populated when callbacks drain.
                assert!(get_sync_engine().is_ok());
                assert_eq!(engine.config().url, "ws://test.invalid/a");
                ready_count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ready_count.load(Ordering::SeqCst), 0);

        // Configure: pending callbacks drain exactly once.
        let engine_a = configure_sync_engine_with(
            SyncEngineConfig::new("ws://test.invalid/a").with_client_id("peer-a"),
            Arc::new(hub.connector()),
            None,
        )
        .unwrap();
        assert_eq!(ready_count.load(Ordering::SeqCst), 1);

        // get() returns the same instance; same-config reconfigure too.
        assert!(Arc::ptr_eq(&get_sync_engine().unwrap(), &engine_a));
        let again = configure_sync_engine_with(
            SyncEngineConfig::new("ws://test.invalid/a").with_client_id("peer-a"),
            Arc::new(hub.connector()),
            None,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&again, &engine_a));

        // Ready callbacks registered while live fire immediately.
        {
            let ready_count = Arc::clone(&ready_count);
            on_sync_engine_ready(move |_| {
                ready_count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ready_count.load(Ordering::SeqCst), 2);

        // A differing configuration replaces the engine, closing the old one.
        wait_for(|| engine_a.status() == ConnectionStatus::Online).await;
        let engine_b = configure_sync_engine_with(
            SyncEngineConfig::new("ws://test.invalid/b").with_client_id("peer-b"),
            Arc::new(hub.connector()),
            None,
        )
        .unwrap();
        assert!(!Arc::ptr_eq(&engine_a, &engine_b));
        assert_eq!(engine_a.status(), ConnectionStatus::Closed);
        assert!(Arc::ptr_eq(&get_sync_engine().unwrap(), &engine_b));

        // close() tears down and clears the slot; double close is a no-op.
        close_sync_engine();
        close_sync_engine();
        assert_eq!(engine_b.status(), ConnectionStatus::Closed);
        assert!(matches!(get_sync_engine(), Err(SyncError::NotConfigured)));
    }
}
