//! Test utilities for tidesync_core.
//!
//! This module provides shared testing infrastructure: an in-memory
//! transport hub that relays binary frames between connected peers, so
//! engines can be exercised end-to-end without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::sync::{Connector, Transport, TransportError, WsMessage};

/// Shared hub state: every connected peer's inbox sender.
struct HubState {
    next_id: u64,
    peers: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    refuse: bool,
}

/// An in-memory relay standing in for a sync server.
///
/// Every transport connected through `connector()` receives the binary
/// frames sent by every other transport (the sender itself is excluded,
/// like a broadcast relay). Cloning shares the same hub.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_id: 1,
                peers: HashMap::new(),
                refuse: false,
            })),
        }
    }

    /// A connector that joins this hub on every `connect()`.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Drop every live connection, as a server going away would.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.peers.clear();
    }

    /// Make subsequent `connect()` calls fail while `refuse` is true.
    pub fn refuse_connections(&self, refuse: bool) {
        let mut state = self.state.lock().unwrap();
        state.refuse = refuse;
    }

    /// Number of currently connected peers.
    pub fn peer_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.peers.len()
    }

    /// Inject a frame to every connected peer (server-originated push).
    pub fn broadcast(&self, data: Vec<u8>) {
        let state = self.state.lock().unwrap();
        for sender in state.peers.values() {
            let _ = sender.send(data.clone());
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector producing `MemoryTransport` channels joined to a hub.
pub struct MemoryConnector {
    state: Arc<Mutex<HubState>>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (sender, inbox) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.refuse {
                return Err(TransportError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.peers.insert(id, sender);
            id
        };

        Ok(Box::new(MemoryTransport {
            id,
            state: Arc::clone(&self.state),
            inbox,
        }))
    }
}

/// One side of an in-memory hub connection.
pub struct MemoryTransport {
    id: u64,
    state: Arc<Mutex<HubState>>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        if !state.peers.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for (peer_id, sender) in &state.peers {
            if *peer_id != self.id {
                let _ = sender.send(data.clone());
            }
        }
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        if state.peers.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        self.inbox.recv().await.map(|data| Ok(WsMessage::Binary(data)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.peers.remove(&self.id);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.peers.remove(&self.id);
    }
}
