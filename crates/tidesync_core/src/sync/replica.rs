//! Replica capability: the CRDT document behind a narrow interface.
//!
//! The engine consumes the replica engine as an opaque capability: open a
//! document, apply a local mutation, merge a remote change set, read a
//! snapshot. The concrete CRDT representation is swappable: `YrsReplica`
//! (the default, backed by `yrs`) implements the trait, and applications
//! can install a different engine through `init_replica_engine_with()`.

use std::collections::HashMap;
use std::sync::Arc;

use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use crate::error::{Result, SyncError};

/// Name of the root map holding the document's key/value state.
const ROOT_MAP_NAME: &str = "root";

/// Mutation surface handed to `Replica::mutate` closures.
///
/// A draft is a transactional view of the document's root map; every change
/// made through it lands in a single change set.
pub trait Draft {
    /// Set `key` to `value`.
    fn set(&mut self, key: &str, value: serde_json::Value);

    /// Remove `key` if present.
    fn remove(&mut self, key: &str);

    /// Read the current value of `key` inside the draft.
    fn get(&self, key: &str) -> Option<serde_json::Value>;
}

/// An opaque replicated document.
///
/// Implementations guarantee convergence: all replicas that have received
/// the same set of change sets reach equal state, irrespective of delivery
/// order.
pub trait Replica: Send + Sync {
    /// Apply a local mutation and return the change-set bytes to broadcast.
    ///
    /// An empty vec means the mutation did not change the document and
    /// nothing needs to be sent.
    fn mutate(&self, f: &mut dyn FnMut(&mut dyn Draft)) -> Result<Vec<u8>>;

    /// Merge a change set received from a remote peer.
    fn apply_remote(&self, payload: &[u8]) -> Result<()>;

    /// Current document state as a JSON value.
    fn snapshot(&self) -> serde_json::Value;

    /// Encoded state vector, for delta exchange.
    fn state_vector(&self) -> Vec<u8>;

    /// Change set covering everything the holder of `state_vector` is missing.
    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>>;
}

/// Creates replicas for the document registry.
pub trait ReplicaFactory: Send + Sync {
    /// Open (create) a replica for the given document id.
    fn open(&self, doc_id: &str) -> Arc<dyn Replica>;
}

/// The default replica, backed by a `yrs::Doc` with a root map.
pub struct YrsReplica {
    doc_id: String,
    doc: Doc,
    root: MapRef,
}

impl YrsReplica {
    /// Create an empty replica for the given document id.
    pub fn new(doc_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(ROOT_MAP_NAME);
        Self {
            doc_id: doc_id.into(),
            doc,
            root,
        }
    }

    /// The document id this replica belongs to.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

impl Replica for YrsReplica {
    fn mutate(&self, f: &mut dyn FnMut(&mut dyn Draft)) -> Result<Vec<u8>> {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            let mut draft = YrsDraft {
                map: &self.root,
                txn: &mut txn,
            };
            f(&mut draft);
        }

        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&sv_before)
        };

        // A no-op mutation still encodes an empty update header.
        if update.len() <= 2 {
            return Ok(Vec::new());
        }
        Ok(update)
    }

    fn apply_remote(&self, payload: &[u8]) -> Result<()> {
        let update = Update::decode_v1(payload)
            .map_err(|e| SyncError::Replica(format!("failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Replica(format!("failed to apply update: {}", e)))?;
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        let txn = self.doc.transact();
        any_to_json(&self.root.to_json(&txn))
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::Replica(format!("failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }
}

impl std::fmt::Debug for YrsReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsReplica")
            .field("doc_id", &self.doc_id)
            .finish()
    }
}

/// Factory producing `YrsReplica` documents.
#[derive(Debug, Default)]
pub struct YrsReplicaFactory;

impl ReplicaFactory for YrsReplicaFactory {
    fn open(&self, doc_id: &str) -> Arc<dyn Replica> {
        Arc::new(YrsReplica::new(doc_id))
    }
}

/// Draft over a yrs root map within one write transaction.
struct YrsDraft<'a, 'txn> {
    map: &'a MapRef,
    txn: &'a mut yrs::TransactionMut<'txn>,
}

impl Draft for YrsDraft<'_, '_> {
    fn set(&mut self, key: &str, value: serde_json::Value) {
        self.map.insert(self.txn, key, json_to_any(&value));
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(self.txn, key);
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let out = self.map.get(&*self.txn, key)?;
        Some(any_to_json(&out.to_json(&*self.txn)))
    }
}

/// Convert a JSON value into a yrs `Any`.
fn json_to_any(value: &serde_json::Value) -> Any {
    match value {
        serde_json::Value::Null => Any::Null,
        serde_json::Value::Bool(b) => Any::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Any::String(s.as_str().into()),
        serde_json::Value::Array(items) => {
            Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(entries) => {
            let map: HashMap<String, Any> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(map))
        }
    }
}

/// Convert a yrs `Any` back into a JSON value.
fn any_to_json(any: &Any) -> serde_json::Value {
    match any {
        Any::Null | Any::Undefined => serde_json::Value::Null,
        Any::Bool(b) => serde_json::Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Any::BigInt(i) => serde_json::Value::Number((*i).into()),
        Any::String(s) => serde_json::Value::String(s.to_string()),
        Any::Buffer(bytes) => serde_json::Value::Array(
            bytes
                .iter()
                .map(|b| serde_json::Value::Number((*b).into()))
                .collect(),
        ),
        Any::Array(items) => serde_json::Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => {
            let mut obj = serde_json::Map::new();
            for (key, value) in entries.iter() {
                obj.insert(key.clone(), any_to_json(value));
            }
            serde_json::Value::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutate_and_snapshot() {
        let replica = YrsReplica::new("doc1");
        let update = replica
            .mutate(&mut |draft| {
                draft.set("x", json!(1));
                draft.set("title", json!("hello"));
            })
            .unwrap();

        assert!(!update.is_empty());
        let snapshot = replica.snapshot();
        assert_eq!(snapshot["x"], json!(1));
        assert_eq!(snapshot["title"], json!("hello"));
    }

    #[test]
    fn test_noop_mutation_produces_empty_update() {
        let replica = YrsReplica::new("doc1");
        let update = replica.mutate(&mut |_draft| {}).unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn test_draft_get_sees_pending_writes() {
        let replica = YrsReplica::new("doc1");
        replica
            .mutate(&mut |draft| {
                draft.set("x", json!(10));
                assert_eq!(draft.get("x"), Some(json!(10)));
                assert_eq!(draft.get("missing"), None);
            })
            .unwrap();
    }

    #[test]
    fn test_remove_key() {
        let replica = YrsReplica::new("doc1");
        replica.mutate(&mut |draft| draft.set("x", json!(1))).unwrap();
        replica.mutate(&mut |draft| draft.remove("x")).unwrap();
        assert_eq!(replica.snapshot(), json!({}));
    }

    #[test]
    fn test_two_replicas_converge() {
        let a = YrsReplica::new("doc1");
        let b = YrsReplica::new("doc1");

        let update_a = a.mutate(&mut |draft| draft.set("from_a", json!(true))).unwrap();
        let update_b = b.mutate(&mut |draft| draft.set("from_b", json!(true))).unwrap();

        // Deliver in opposite orders; both must land in the same state.
        b.apply_remote(&update_a).unwrap();
        a.apply_remote(&update_b).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot()["from_a"], json!(true));
        assert_eq!(a.snapshot()["from_b"], json!(true));
    }

    #[test]
    fn test_diff_exchange_catches_up_peer() {
        let a = YrsReplica::new("doc1");
        let b = YrsReplica::new("doc1");

        a.mutate(&mut |draft| draft.set("x", json!(1))).unwrap();
        a.mutate(&mut |draft| draft.set("y", json!(2))).unwrap();

        let missing = a.diff(&b.state_vector()).unwrap();
        b.apply_remote(&missing).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_apply_remote_rejects_garbage() {
        let replica = YrsReplica::new("doc1");
        assert!(replica.apply_remote(&[0xFF, 0x00, 0x13, 0x37]).is_err());
    }

    #[test]
    fn test_nested_values_round_trip() {
        let replica = YrsReplica::new("doc1");
        let value = json!({"list": [1, 2, 3], "nested": {"flag": false}});
        replica
            .mutate(&mut |draft| draft.set("data", value.clone()))
            .unwrap();
        assert_eq!(replica.snapshot()["data"], value);
    }
}
