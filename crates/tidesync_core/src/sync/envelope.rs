//! Wire envelope for multiplexing documents over one transport.
//!
//! Every change set travels as a `ChangeEnvelope` tagged with the document
//! id (for routing on the receiving side) and the originating peer (so a
//! relay echoing our own broadcast back can be detected and skipped).
//!
//! # Wire Format
//!
//! Binary frames, big-endian lengths:
//!
//! ```text
//! [version: u8][doc_id_len: u32][doc_id][origin_len: u32][origin][payload]
//! ```
//!
//! Malformed frames decode to `None` and are dropped by the caller with a
//! diagnostic; decoding never panics.

use super::types::PeerId;

/// Wire format version byte.
const WIRE_VERSION: u8 = 1;

/// The unit of change exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEnvelope {
    /// Identifier of the document this change belongs to.
    pub doc_id: String,
    /// Peer that produced the change.
    pub origin: PeerId,
    /// Opaque replica change-set bytes.
    pub payload: Vec<u8>,
}

impl ChangeEnvelope {
    /// Create an envelope.
    pub fn new(doc_id: impl Into<String>, origin: PeerId, payload: Vec<u8>) -> Self {
        Self {
            doc_id: doc_id.into(),
            origin,
            payload,
        }
    }

    /// Encode the envelope into a binary frame.
    pub fn encode(&self) -> Vec<u8> {
        let doc = self.doc_id.as_bytes();
        let origin = self.origin.as_str().as_bytes();

        let mut buf = Vec::with_capacity(1 + 4 + doc.len() + 4 + origin.len() + self.payload.len());
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&(doc.len() as u32).to_be_bytes());
        buf.extend_from_slice(doc);
        buf.extend_from_slice(&(origin.len() as u32).to_be_bytes());
        buf.extend_from_slice(origin);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a binary frame into an envelope.
    ///
    /// Returns `None` for frames with an unknown version, truncated fields
    /// or non-UTF-8 identifiers.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 1 + 4 || data[0] != WIRE_VERSION {
            return None;
        }

        let mut pos = 1usize;
        let doc_id = read_string(data, &mut pos)?;
        let origin = read_string(data, &mut pos)?;
        let payload = data[pos..].to_vec();

        Some(Self {
            doc_id,
            origin: PeerId::new(origin),
            payload,
        })
    }
}

/// Read a u32-length-prefixed UTF-8 string starting at `*pos`.
fn read_string(data: &[u8], pos: &mut usize) -> Option<String> {
    let len_end = pos.checked_add(4)?;
    let len_bytes: [u8; 4] = data.get(*pos..len_end)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    let end = len_end.checked_add(len)?;
    let raw = data.get(len_end..end)?;
    *pos = end;

    String::from_utf8(raw.to_vec()).ok()
}
