//! In-memory representation of one note's CRDT state (§4.4 "Document
//! cache").
//!
//! Generalizes `BodyDoc`'s "mutex wraps a yrs::Doc" shape: one `TextRef`
//! for the note body, one `MapRef` for structured metadata mirrored into
//! the external metadata index. Unlike `BodyDoc`, persistence is not
//! built in here — `DocumentSnapshot` only holds state in memory; the
//! loader and log writer own the file I/O (§4.3, §4.5).

use yrs::{
    Doc, GetString, Map, MapRef, Observable, ReadTxn, Subscription, Text, TextRef, Transact,
    Update, updates::decoder::Decode, updates::encoder::Encode,
};

use crate::error::{NoteCoveError, Result};
use crate::ids::InstanceId;

use super::vector_clock::VectorClock;

const BODY_TEXT_NAME: &str = "body";
const METADATA_MAP_NAME: &str = "metadata";

/// A single note's live CRDT state plus its vector clock.
///
/// Mirrors `BodyDoc`'s structure: a `yrs::Doc` guarded implicitly by yrs's
/// own transaction locking, with thin typed accessors over its root
/// shared types. `apply_local` and `apply_remote` replace `BodyDoc`'s
/// single `apply_update` — local edits never carry a sequence number to
/// validate, remote updates always do (§9 "Replacing exception-for-
/// control-flow": a sequence mismatch is a `Result` variant, not a panic).
pub struct DocumentSnapshot {
    doc: Doc,
    body: TextRef,
    metadata: MapRef,
    clock: std::sync::Mutex<VectorClock>,
}

impl DocumentSnapshot {
    /// A brand new, empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let body = doc.get_or_insert_text(BODY_TEXT_NAME);
        let metadata = doc.get_or_insert_map(METADATA_MAP_NAME);
        Self {
            doc,
            body,
            metadata,
            clock: std::sync::Mutex::new(VectorClock::new()),
        }
    }

    /// Rehydrate from a previously encoded state (a snapshot or the
    /// concatenation of replayed log updates), carrying over the vector
    /// clock that went with it.
    pub fn from_state(state: &[u8], clock: VectorClock) -> Result<Self> {
        let snapshot = Self::new();
        if !state.is_empty() {
            let update = Update::decode_v1(state)
                .map_err(|e| NoteCoveError::Crdt(format!("decode state: {e}")))?;
            let mut txn = snapshot.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| NoteCoveError::Crdt(format!("apply state: {e}")))?;
        }
        *snapshot.clock.lock().unwrap() = clock;
        Ok(snapshot)
    }

    /// Current body text.
    pub fn get_body(&self) -> String {
        let txn = self.doc.transact();
        self.body.get_string(&txn)
    }

    /// Get a metadata field as a JSON-ish string (yrs `Any` cast to
    /// `String`).
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.metadata.get(&txn, key).and_then(|v| v.cast::<String>().ok())
    }

    /// Apply a local edit: replace the body with `content` using a
    /// minimal diff so unrelated CRDT op IDs are preserved, and return the
    /// encoded update to hand to the log writer. Local edits don't carry
    /// a sequence number — the writer assigns one when it appends.
    pub fn apply_local(&self, content: &str) -> Vec<u8> {
        let (current, sv_before) = {
            let txn = self.doc.transact();
            (self.body.get_string(&txn), txn.state_vector())
        };
        if current == content {
            return Vec::new();
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_start = common_prefix;
        let delete_end = current_chars.len() - common_suffix;
        let insert_end = new_chars.len() - common_suffix;

        {
            let mut txn = self.doc.transact_mut();
            if delete_end > delete_start {
                self.body
                    .remove_range(&mut txn, delete_start as u32, (delete_end - delete_start) as u32);
            }
            if insert_end > common_prefix {
                let text: String = new_chars[common_prefix..insert_end].iter().collect();
                self.body.insert(&mut txn, delete_start as u32, &text);
            }
        }

        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&sv_before)
    }

    /// Set a metadata field as a local edit, returning the encoded update.
    pub fn set_metadata_local(&self, key: &str, value: &str) -> Vec<u8> {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            self.metadata.insert(&mut txn, key, value);
        }
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&sv_before)
    }

    /// Record this document's own position in its owning instance's log
    /// after a local write has been durably appended by the log writer.
    /// Local writes assign their own sequence atomically (§4.4) so there
    /// is nothing to validate here, unlike [`Self::apply_remote`].
    pub fn record_local_write(&self, instance: &InstanceId, sequence: u64, offset: u64, filename: &str) {
        self.clock
            .lock()
            .unwrap()
            .advance(instance.clone(), sequence, offset, filename.to_string());
    }

    /// Apply an update read from another instance's log. `sequence` must
    /// be exactly one past this document's recorded position for
    /// `origin`; otherwise the caller has a gap to fill first and this
    /// returns `SequenceViolation` rather than silently skipping ahead.
    pub fn apply_remote(
        &self,
        origin: &InstanceId,
        sequence: u64,
        offset: u64,
        filename: &str,
        payload: &[u8],
    ) -> Result<()> {
        let expected = {
            let clock = self.clock.lock().unwrap();
            clock.sequence_for(origin) + 1
        };
        if sequence != expected {
            return Err(NoteCoveError::SequenceViolation {
                expected,
                got: sequence,
            });
        }

        let update = Update::decode_v1(payload)
            .map_err(|e| NoteCoveError::Crdt(format!("decode update: {e}")))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| NoteCoveError::Crdt(format!("apply update: {e}")))?;
        }

        self.clock
            .lock()
            .unwrap()
            .advance(origin.clone(), sequence, offset, filename.to_string());
        Ok(())
    }

    /// Encode the full current state (used for snapshots).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }

    /// Encode the yrs state vector (not the same as the durable
    /// `VectorClock` — this is yrs's own merge bookkeeping).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Read-only snapshot of the durable vector clock.
    pub fn vector_clock(&self) -> VectorClock {
        self.clock.lock().unwrap().clone()
    }

    /// Subscribe to body text changes. The callback fires after the
    /// mutating transaction has dropped its lock (§9 "Observer pattern
    /// without heap cycles").
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.body.observe(move |_txn, _event| callback())
    }
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DocumentSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSnapshot")
            .field("body_len", &self.get_body().len())
            .finish_non_exhaustive()
    }
}
