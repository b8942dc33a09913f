//! Store binding middleware: bridge application state to a document.
//!
//! A `StoreBinding` connects one reactive application store to one
//! synchronized document, in both directions:
//!
//! - local store mutations flow into the document through `update()`;
//! - document changes flow back into the store through the `apply_patch`
//!   callback, carrying the post-change snapshot.
//!
//! The binding suppresses the feedback loop: a mutation it just applied to
//! the document is not replayed into the store when the registry reports
//! that same change back. Changes the binding did not originate (remote
//! merges, and local mutations made through other paths) do reach
//! `apply_patch`, so the store never misses state it did not produce.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::registry::{DocSubscription, DocumentRegistry};
use super::replica::Draft;
use super::types::ChangeOrigin;
use crate::error::Result;

/// Callback applying a document snapshot back into the application store.
pub type ApplyPatch = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// A two-way binding between an application store and one document.
///
/// Dropping the binding (or calling `unbind()`) detaches both directions.
pub struct StoreBinding {
    registry: Arc<DocumentRegistry>,
    doc_id: String,
    /// Set while this binding's own `update()` runs; notifications observed
    /// with the flag up are self-originated and skipped.
    self_origin: Arc<AtomicBool>,
    subscription: Mutex<Option<DocSubscription>>,
}

impl StoreBinding {
    /// Bind a store to `doc_id`, opening the document if needed.
    ///
    /// `apply_patch` receives the post-change snapshot for every remote
    /// merge and every local mutation not made through this binding.
    pub fn bind(
        registry: Arc<DocumentRegistry>,
        doc_id: impl Into<String>,
        apply_patch: ApplyPatch,
    ) -> Result<Self> {
        let doc_id = doc_id.into();
        let self_origin = Arc::new(AtomicBool::new(false));

        let subscription = {
            let patch_registry = Arc::clone(&registry);
            let patch_doc_id = doc_id.clone();
            let self_origin = Arc::clone(&self_origin);
            registry.subscribe(
                &doc_id,
                Arc::new(move |event| {
                    if event.origin == ChangeOrigin::Local
                        && self_origin.load(Ordering::SeqCst)
                    {
                        log::trace!(
                            "[StoreBinding] skipping self-originated change for '{}'",
                            event.doc_id
                        );
                        return;
                    }
                    if let Some(snapshot) = patch_registry.snapshot(&patch_doc_id) {
                        apply_patch(&snapshot);
                    }
                }),
            )?
        };

        Ok(Self {
            registry,
            doc_id,
            self_origin,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// The bound document id.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Apply a local store mutation to the document.
    ///
    /// The change is visible to other subscribers immediately; this
    /// binding's own `apply_patch` is not re-invoked for it.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Draft),
    {
        self.self_origin.store(true, Ordering::SeqCst);
        let result = self.registry.mutate(&self.doc_id, f);
        self.self_origin.store(false, Ordering::SeqCst);
        result
    }

    /// Detach both directions. Idempotent.
    pub fn unbind(&self) {
        let subscription = self.subscription.lock().unwrap().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            log::debug!("[StoreBinding] unbound from '{}'", self.doc_id);
        }
    }
}

impl Drop for StoreBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl std::fmt::Debug for StoreBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBinding")
            .field("doc_id", &self.doc_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::envelope::ChangeEnvelope;
    use crate::sync::replica::{Replica, YrsReplica, YrsReplicaFactory};
    use crate::sync::types::PeerId;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn create_registry() -> Arc<DocumentRegistry> {
        Arc::new(DocumentRegistry::new(
            PeerId::new("local-peer"),
            Arc::new(YrsReplicaFactory),
        ))
    }

    #[test]
    fn test_own_update_does_not_feed_back() {
        let registry = create_registry();
        let patches = Arc::new(AtomicUsize::new(0));

        let binding = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let patches = Arc::clone(&patches);
            Arc::new(move |_snapshot| {
                patches.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();

        binding.update(|draft| draft.set("x", json!(1))).unwrap();
        assert_eq!(patches.load(Ordering::SeqCst), 0);
        assert_eq!(registry.snapshot("doc1").unwrap()["x"], json!(1));
    }

    #[test]
    fn test_remote_change_reaches_store() {
        let registry = create_registry();
        let last_patch: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));

        let _binding = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let last_patch = Arc::clone(&last_patch);
            Arc::new(move |snapshot| {
                *last_patch.lock().unwrap() = Some(snapshot.clone());
            })
        })
        .unwrap();

        let remote = YrsReplica::new("doc1");
        let payload = remote.mutate(&mut |draft| draft.set("x", json!(2))).unwrap();
        registry
            .apply_remote(&ChangeEnvelope::new("doc1", PeerId::new("remote"), payload))
            .unwrap();

        let patch = last_patch.lock().unwrap().clone().unwrap();
        assert_eq!(patch["x"], json!(2));
    }

    #[test]
    fn test_foreign_local_mutation_reaches_store() {
        let registry = create_registry();
        let patches = Arc::new(AtomicUsize::new(0));

        let _binding = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let patches = Arc::clone(&patches);
            Arc::new(move |_| {
                patches.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();

        // A mutation made outside the binding must be replayed into the store.
        registry.mutate("doc1", |draft| draft.set("y", json!(3))).unwrap();
        assert_eq!(patches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbind_detaches_and_is_idempotent() {
        let registry = create_registry();
        let patches = Arc::new(AtomicUsize::new(0));

        let binding = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let patches = Arc::clone(&patches);
            Arc::new(move |_| {
                patches.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();

        binding.unbind();
        binding.unbind();

        registry.mutate("doc1", |draft| draft.set("x", json!(1))).unwrap();
        assert_eq!(patches.load(Ordering::SeqCst), 0);

        // Updates through an unbound binding still reach the document.
        binding.update(|draft| draft.set("x", json!(2))).unwrap();
        assert_eq!(registry.snapshot("doc1").unwrap()["x"], json!(2));
    }

    #[test]
    fn test_two_bindings_do_not_suppress_each_other() {
        let registry = create_registry();
        let patches_a = Arc::new(AtomicUsize::new(0));
        let patches_b = Arc::new(AtomicUsize::new(0));

        let binding_a = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let patches = Arc::clone(&patches_a);
            Arc::new(move |_| {
                patches.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        let _binding_b = StoreBinding::bind(Arc::clone(&registry), "doc1", {
            let patches = Arc::clone(&patches_b);
            Arc::new(move |_| {
                patches.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();

        binding_a.update(|draft| draft.set("x", json!(1))).unwrap();

        // A's own change: suppressed for A, delivered to B.
        assert_eq!(patches_a.load(Ordering::SeqCst), 0);
        assert_eq!(patches_b.load(Ordering::SeqCst), 1);
    }
}
