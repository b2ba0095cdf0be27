//! Metadata index — external interface only (§4 "Metadata index is owned
//! by an external collaborator").
//!
//! The engine never ships a production index implementation; it only
//! defines the trait the rest of the crate depends on, the same way
//! `diaryx_core::fs::FileSystem` is a trait the app substitutes a real
//! implementation for. A trivial in-memory implementation lives under
//! `#[cfg(test)]` to exercise the watcher's full-scan fallback (§4.8 step
//! 2) and the reload pipeline's `ensure_applied` in integration tests.

use crate::ids::{NoteId, SdId};

/// One index entry: everything the rest of the system needs to know
/// about a note without opening its CRDT state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord {
    /// Note this record describes.
    pub note_id: NoteId,
    /// Storage directory the note lives in.
    pub sd: SdId,
    /// Title, if known, mirrored out of the note's metadata map.
    pub title: Option<String>,
}

/// Projection the engine reads/writes notes through, owned by an
/// external collaborator (a database, a search index, an app-level
/// cache) rather than by this crate.
pub trait MetadataIndex: Send + Sync {
    /// Insert or update a note's record.
    fn upsert_note(&self, record: NoteRecord);

    /// Look up a note's record, if indexed.
    fn get_note(&self, note_id: &NoteId) -> Option<NoteRecord>;

    /// All notes indexed for a given SD.
    fn notes_in_sd(&self, sd: &SdId) -> Vec<NoteRecord>;
}

#[cfg(test)]
pub use test_support::InMemoryMetadataIndex;
