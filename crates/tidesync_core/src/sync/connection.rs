//! Connection manager: owns the transport and tracks connectivity.
//!
//! The manager runs a background task (the run loop) that establishes the
//! transport channel, pumps inbound frames to the registered message
//! callback, writes queued outgoing envelopes, and reconnects with
//! exponential backoff when the channel drops. Connectivity transitions are
//! reported through the status callback on actual change only, and never
//! after `close()`.
//!
//! Outgoing envelopes enqueue on an unbounded channel; while the socket is
//! down they simply wait for the next session (the replica's own history
//! covers anything that was never delivered, so nothing is lost if the
//! queue is dropped at close).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::mpsc;

use super::envelope::ChangeEnvelope;
use super::transport::{Connector, Transport, WsMessage};
use super::types::{ConnectionStatus, PeerId, ReconnectConfig, SyncEngineConfig};

/// Callback type for inbound envelopes.
pub type MessageCallback = Arc<dyn Fn(ChangeEnvelope) + Send + Sync>;

/// Callback type for connection status changes.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Keepalive ping interval for established sessions.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Owns one transport channel, tracks online/offline status and attaches
/// peer identity to outgoing traffic.
pub struct ConnectionManager {
    peer_id: PeerId,
    url: String,
    reconnect: ReconnectConfig,
    status: Mutex<ConnectionStatus>,
    on_status: Mutex<Option<StatusCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    outgoing_tx: mpsc::UnboundedSender<ChangeEnvelope>,
    running: AtomicBool,
    shutdown: Notify,
}

impl ConnectionManager {
    /// Open a connection manager for the given configuration.
    ///
    /// Returns immediately after spawning the run loop; connection
    /// completion is asynchronous and reported via the status callback.
    pub fn open(
        config: &SyncEngineConfig,
        connector: Arc<dyn Connector>,
        on_status: Option<StatusCallback>,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            peer_id: config.peer_id(),
            url: config.url.clone(),
            reconnect: config.reconnect.clone(),
            status: Mutex::new(ConnectionStatus::Connecting),
            on_status: Mutex::new(on_status),
            on_message: Mutex::new(None),
            outgoing_tx,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        let run = Arc::clone(&manager);
        tokio::spawn(async move {
            run.run(connector, outgoing_rx).await;
        });

        manager
    }

    /// The peer identity stamped on this manager's traffic.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    /// Register the callback receiving inbound envelopes.
    ///
    /// Frames arriving before a callback is registered are dropped with a
    /// diagnostic.
    pub fn set_on_message(&self, callback: MessageCallback) {
        let mut on_message = self.on_message.lock().unwrap();
        *on_message = Some(callback);
    }

    /// Queue an envelope for delivery.
    ///
    /// Never raises: when the manager is closed the envelope is dropped
    /// with a diagnostic; while connecting or offline it waits for the next
    /// established session.
    pub fn send(&self, envelope: ChangeEnvelope) {
        if self.status() == ConnectionStatus::Closed {
            log::warn!(
                "[Connection] dropping envelope for '{}': connection closed",
                envelope.doc_id
            );
            return;
        }
        let _ = self.outgoing_tx.send(envelope);
    }

    /// Close the manager. Idempotent.
    ///
    /// Marks the status `Closed` (terminal), stops status notifications and
    /// wakes the run loop so the socket is released on every exit path,
    /// including mid-connect.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            {
                let mut status = self.status.lock().unwrap();
                *status = ConnectionStatus::Closed;
            }
            *self.on_status.lock().unwrap() = None;
            self.shutdown.notify_one();
            log::info!("[Connection] closed");
        }
    }

    /// Transition the status, notifying the callback on actual change only.
    ///
    /// `Closed` is terminal: once entered no further transition is recorded
    /// or reported.
    fn set_status(&self, next: ConnectionStatus) {
        let callback = {
            let mut status = self.status.lock().unwrap();
            if *status == next || *status == ConnectionStatus::Closed {
                return;
            }
            log::info!("[Connection] status changed to: {}", next);
            *status = next;
            self.on_status.lock().unwrap().clone()
        };
        // close() may have raced in after the lock was released.
        if let Some(callback) = callback {
            if self.running.load(Ordering::SeqCst) {
                callback(next);
            }
        }
    }

    /// Connection run loop: connect, pump one session, reconnect with
    /// exponential backoff until closed or attempts are exhausted.
    async fn run(
        self: Arc<Self>,
        connector: Arc<dyn Connector>,
        mut outgoing_rx: mpsc::UnboundedReceiver<ChangeEnvelope>,
    ) {
        let rc = self.reconnect.clone();
        let mut attempt = 0u32;

        while self.running.load(Ordering::SeqCst) {
            if attempt > 0 {
                if rc.max_attempts > 0 && attempt >= rc.max_attempts {
                    log::info!("[Connection] max reconnection attempts reached");
                    break;
                }
                let delay = rc.base_delay_secs.saturating_pow(attempt).min(rc.max_delay_secs);
                log::info!(
                    "[Connection] reconnecting in {}s (attempt {}/{})",
                    delay,
                    attempt,
                    if rc.max_attempts == 0 {
                        "∞".to_string()
                    } else {
                        rc.max_attempts.to_string()
                    }
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = self.shutdown.notified() => break,
                }
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
            }

            self.set_status(ConnectionStatus::Connecting);

            let connected = tokio::select! {
                result = connector.connect(&self.url) => result,
                _ = self.shutdown.notified() => break,
            };

            match connected {
                Ok(transport) => {
                    log::info!("[Connection] connected to {}", self.url);
                    self.set_status(ConnectionStatus::Online);
                    attempt = 0;

                    self.run_session(transport, &mut outgoing_rx).await;

                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.set_status(ConnectionStatus::Offline);
                    if !rc.enabled {
                        break;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("[Connection] connection failed: {}", e);
                    self.set_status(ConnectionStatus::Offline);
                    if !rc.enabled {
                        break;
                    }
                    attempt += 1;
                }
            }
        }

        log::debug!("[Connection] run loop exited");
    }

    /// Pump one established session until the channel drops or close().
    async fn run_session(
        &self,
        mut transport: Box<dyn Transport>,
        outgoing_rx: &mut mpsc::UnboundedReceiver<ChangeEnvelope>,
    ) {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                message = transport.recv() => {
                    match message {
                        Some(Ok(WsMessage::Binary(data))) => self.dispatch_inbound(&data),
                        Some(Ok(WsMessage::Close)) => {
                            log::info!("[Connection] closed by remote");
                            break;
                        }
                        Some(Ok(_)) => {} // text / ping / pong
                        Some(Err(e)) => {
                            log::warn!("[Connection] transport error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                envelope = outgoing_rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            log::trace!(
                                "[Connection] sending {} bytes for '{}'",
                                envelope.payload.len(),
                                envelope.doc_id
                            );
                            if let Err(e) = transport.send_binary(envelope.encode()).await {
                                log::warn!("[Connection] send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = transport.send_ping().await {
                        log::warn!("[Connection] keepalive failed: {}", e);
                        break;
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }

        let _ = transport.close().await;
    }

    /// Decode an inbound frame and hand it to the message callback.
    fn dispatch_inbound(&self, data: &[u8]) {
        let Some(envelope) = ChangeEnvelope::decode(data) else {
            log::debug!("[Connection] dropping undecodable frame ({} bytes)", data.len());
            return;
        };

        // A relay may echo our own broadcast back to us.
        if envelope.origin == self.peer_id {
            log::trace!("[Connection] skipping own echo for '{}'", envelope.doc_id);
            return;
        }

        let callback = self.on_message.lock().unwrap().clone();
        match callback {
            Some(callback) => callback(envelope),
            None => log::debug!(
                "[Connection] dropping envelope for '{}': no message callback",
                envelope.doc_id
            ),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer_id", &self.peer_id)
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}
