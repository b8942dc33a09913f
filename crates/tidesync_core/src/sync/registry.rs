//! Document registry: multiplexes many documents over one connection.
//!
//! The registry maps document ids to replicas, fans local mutations out to
//! the connection manager, routes inbound remote changes into the right
//! replica and notifies per-document subscribers on every change.
//!
//! Local mutations are visible to local subscribers before the outgoing
//! envelope is handed to the connection (read-your-writes); subscribers
//! cannot tell a `mutate`-triggered notification from an `apply_remote`
//! one except by the origin tag; suppressing self-echoes is the store
//! binding's job, not the registry's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::envelope::ChangeEnvelope;
use super::replica::{Draft, Replica, ReplicaFactory};
use super::types::{ChangeOrigin, DocEvent, PeerId};
use crate::error::{Result, SyncError};

/// Callback type for document change notifications.
pub type DocCallback = Arc<dyn Fn(&DocEvent) + Send + Sync>;

/// Callback type for handing outgoing envelopes to the connection layer.
pub type OutgoingSender = Arc<dyn Fn(ChangeEnvelope) + Send + Sync>;

/// One registered document: its replica and its subscriber list.
struct DocumentEntry {
    id: String,
    replica: Arc<dyn Replica>,
    subscribers: Mutex<Vec<(u64, DocCallback)>>,
}

impl DocumentEntry {
    /// Invoke every subscriber with a change event.
    ///
    /// Callbacks are cloned out of the lock first so a subscriber may
    /// subscribe/unsubscribe reentrantly without deadlocking.
    fn notify(&self, origin: ChangeOrigin) {
        let subscribers: Vec<DocCallback> = {
            let subs = self.subscribers.lock().unwrap();
            subs.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        if subscribers.is_empty() {
            return;
        }

        let event = DocEvent {
            doc_id: self.id.clone(),
            origin,
        };
        for callback in subscribers {
            callback(&event);
        }
    }

    fn remove_subscriber(&self, subscriber_id: u64) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|(id, _)| *id != subscriber_id);
    }
}

/// Guard for a document subscription.
///
/// Dropping the guard (or calling `unsubscribe()`) removes exactly this
/// callback and never affects other subscribers. Keep it alive for as long
/// as notifications are wanted.
pub struct DocSubscription {
    entry: Weak<DocumentEntry>,
    subscriber_id: u64,
}

impl DocSubscription {
    /// Remove this subscription's callback. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.remove_subscriber(self.subscriber_id);
        }
    }
}

impl Drop for DocSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for DocSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocSubscription")
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}

/// Maps document ids to replicas and routes changes in both directions.
pub struct DocumentRegistry {
    peer_id: PeerId,
    factory: Arc<dyn ReplicaFactory>,
    entries: RwLock<HashMap<String, Arc<DocumentEntry>>>,
    outgoing: Mutex<Option<OutgoingSender>>,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
}

impl DocumentRegistry {
    /// Create a registry. Outgoing envelopes are stamped with `peer_id`.
    pub fn new(peer_id: PeerId, factory: Arc<dyn ReplicaFactory>) -> Self {
        Self {
            peer_id,
            factory,
            entries: RwLock::new(HashMap::new()),
            outgoing: Mutex::new(None),
            next_subscriber: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Wire the outgoing path to the connection layer.
    pub fn set_outgoing(&self, sender: OutgoingSender) {
        let mut outgoing = self.outgoing.lock().unwrap();
        *outgoing = Some(sender);
    }

    /// Open the document, creating its replica on first access.
    ///
    /// The same `Arc` is returned for the same id for the registry's
    /// lifetime; a document is never backed by two replicas.
    pub fn open(&self, id: &str) -> Result<Arc<dyn Replica>> {
        Ok(self.entry(id)?.replica.clone())
    }

    /// Apply a local mutation to the document, opening it if needed.
    ///
    /// Subscribers are notified with the post-mutation state before the
    /// outgoing envelope is handed to the connection. Network state never
    /// surfaces here: while offline the change stays in the replica's
    /// history until the next successful exchange.
    pub fn mutate<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Draft),
    {
        if self.closed.load(Ordering::SeqCst) {
            log::warn!("[Registry] mutate('{}') ignored: registry closed", id);
            return Ok(());
        }

        let entry = self.entry(id)?;

        let mut f = Some(f);
        let update = entry.replica.mutate(&mut |draft| {
            if let Some(f) = f.take() {
                f(draft);
            }
        })?;

        if update.is_empty() {
            log::trace!("[Registry] mutate('{}') was a no-op", id);
            return Ok(());
        }

        entry.notify(ChangeOrigin::Local);

        let sender = self.outgoing.lock().unwrap().clone();
        if let Some(send) = sender {
            send(ChangeEnvelope::new(id, self.peer_id.clone(), update));
        }
        Ok(())
    }

    /// Merge a change set received from a remote peer.
    ///
    /// An envelope for a document that was never opened locally is dropped
    /// with a diagnostic: a document the application has not opened is not
    /// a subscription target yet.
    pub fn apply_remote(&self, envelope: &ChangeEnvelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!(
                "[Registry] dropping remote change for '{}': registry closed",
                envelope.doc_id
            );
            return Ok(());
        }

        let entry = {
            let entries = self.entries.read().unwrap();
            entries.get(&envelope.doc_id).cloned()
        };
        let Some(entry) = entry else {
            log::debug!(
                "[Registry] dropping remote change for unopened document '{}'",
                envelope.doc_id
            );
            return Ok(());
        };

        entry.replica.apply_remote(&envelope.payload)?;
        entry.notify(ChangeOrigin::Remote);
        Ok(())
    }

    /// Register a change callback for the document, opening it if needed.
    pub fn subscribe(&self, id: &str, callback: DocCallback) -> Result<DocSubscription> {
        let entry = self.entry(id)?;
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        {
            let mut subs = entry.subscribers.lock().unwrap();
            subs.push((subscriber_id, callback));
        }
        Ok(DocSubscription {
            entry: Arc::downgrade(&entry),
            subscriber_id,
        })
    }

    /// Current state of the document, or `None` if it was never opened.
    pub fn snapshot(&self, id: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read().unwrap();
        entries.get(id).map(|entry| entry.replica.snapshot())
    }

    /// Explicitly remove a document, dropping its subscribers and replica.
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut entries = self.entries.write().unwrap();
            entries.remove(id)
        };
        if removed.is_some() {
            log::debug!("[Registry] removed document '{}'", id);
        }
    }

    /// Ids of all currently open documents.
    pub fn document_ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        entries.keys().cloned().collect()
    }

    /// Whether the document has been opened.
    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries.contains_key(id)
    }

    /// The peer identity stamped on outgoing envelopes.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Release all documents and their subscriber lists.
    ///
    /// Does not touch the connection manager; that ownership lives one
    /// level up, in the engine.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        entries.clear();
        log::debug!("[Registry] closed");
    }

    fn entry(&self, id: &str) -> Result<Arc<DocumentEntry>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(id) {
                return Ok(entry.clone());
            }
        }

        let mut entries = self.entries.write().unwrap();
        // Re-check under the write lock: another caller may have won the race.
        if let Some(entry) = entries.get(id) {
            return Ok(entry.clone());
        }

        log::debug!("[Registry] opening document '{}'", id);
        let entry = Arc::new(DocumentEntry {
            id: id.to_string(),
            replica: self.factory.open(id),
            subscribers: Mutex::new(Vec::new()),
        });
        entries.insert(id.to_string(), entry.clone());
        Ok(entry)
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("peer_id", &self.peer_id)
            .field("documents", &self.document_ids().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::replica::{YrsReplica, YrsReplicaFactory};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn create_registry() -> DocumentRegistry {
        DocumentRegistry::new(PeerId::new("local-peer"), Arc::new(YrsReplicaFactory))
    }

    #[test]
    fn test_open_returns_same_replica() {
        let registry = create_registry();
        let a = registry.open("doc1").unwrap();
        let b = registry.open("doc1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.document_ids().len(), 1);
    }

    #[test]
    fn test_mutate_notifies_before_send() {
        let registry = create_registry();

        // Record the order of subscriber notification vs outgoing hand-off.
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            registry.set_outgoing(Arc::new(move |_envelope| {
                order.lock().unwrap().push("send");
            }));
        }
        let _sub = {
            let order = Arc::clone(&order);
            registry
                .subscribe(
                    "doc1",
                    Arc::new(move |event| {
                        assert_eq!(event.origin, ChangeOrigin::Local);
                        order.lock().unwrap().push("notify");
                    }),
                )
                .unwrap()
        };

        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["notify", "send"]);
        assert_eq!(registry.snapshot("doc1").unwrap()["x"], json!(1));
    }

    #[test]
    fn test_outgoing_envelope_is_stamped() {
        let registry = create_registry();
        let sent: Arc<Mutex<Vec<ChangeEnvelope>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let sent = Arc::clone(&sent);
            registry.set_outgoing(Arc::new(move |envelope| {
                sent.lock().unwrap().push(envelope);
            }));
        }

        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].doc_id, "doc1");
        assert_eq!(sent[0].origin, PeerId::new("local-peer"));
        assert!(!sent[0].payload.is_empty());
    }

    #[test]
    fn test_noop_mutation_sends_nothing() {
        let registry = create_registry();
        let sent = Arc::new(AtomicUsize::new(0));
        {
            let sent = Arc::clone(&sent);
            registry.set_outgoing(Arc::new(move |_| {
                sent.fetch_add(1, Ordering::SeqCst);
            }));
        }

        registry.mutate("doc1", |_draft| {}).unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_apply_remote_merges_and_notifies() {
        let registry = create_registry();
        let remote = YrsReplica::new("doc1");
        let payload = remote
            .mutate(&mut |draft| draft.set("x", json!(2)))
            .unwrap();

        registry.open("doc1").unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let notified = Arc::clone(&notified);
            registry
                .subscribe(
                    "doc1",
                    Arc::new(move |event| {
                        assert_eq!(event.origin, ChangeOrigin::Remote);
                        notified.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap()
        };

        let envelope = ChangeEnvelope::new("doc1", PeerId::new("remote-peer"), payload);
        registry.apply_remote(&envelope).unwrap();

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot("doc1").unwrap()["x"], json!(2));
    }

    #[test]
    fn test_unknown_document_envelope_is_dropped() {
        let registry = create_registry();
        registry.open("doc1").unwrap();
        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        let before = registry.snapshot("doc1").unwrap();

        let envelope = ChangeEnvelope::new("never-opened", PeerId::new("p"), vec![1, 2, 3]);
        registry.apply_remote(&envelope).unwrap();

        assert_eq!(registry.snapshot("doc1").unwrap(), before);
        assert!(!registry.contains("never-opened"));
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one_callback() {
        let registry = create_registry();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let sub_a = {
            let count = Arc::clone(&count_a);
            registry
                .subscribe("doc1", Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap()
        };
        let _sub_b = {
            let count = Arc::clone(&count_b);
            registry
                .subscribe("doc1", Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap()
        };

        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        sub_a.unsubscribe();
        registry.mutate("doc1", |draft| draft.set("x", json!(2))).unwrap();

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let registry = create_registry();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            let _sub = registry
                .subscribe("doc1", Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            // Guard dropped here.
        }
        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_drops_document() {
        let registry = create_registry();
        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        registry.remove("doc1");
        assert!(registry.snapshot("doc1").is_none());

        // Reopening yields a fresh replica.
        registry.open("doc1").unwrap();
        assert_eq!(registry.snapshot("doc1").unwrap(), json!({}));
    }

    #[test]
    fn test_close_releases_documents() {
        let registry = create_registry();
        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        registry.close();

        assert!(registry.document_ids().is_empty());
        assert!(matches!(registry.open("doc1"), Err(SyncError::Closed)));
        // mutate after close is absorbed, not an error.
        assert!(registry.mutate("doc1", |draft| draft.set("x", json!(2))).is_ok());
    }
}
