//! A minimal [`MetadataIndex`] for CLI sessions.
//!
//! The engine never ships a production index (it's owned by an external
//! collaborator); the CLI is one such collaborator, and since it has no
//! persistent app to keep records in, an in-memory map scoped to the
//! single invocation is all it needs.

use std::collections::HashMap;
use std::sync::Mutex;

use notecove_core::ids::{NoteId, SdId};
use notecove_core::metadata_index::{MetadataIndex, NoteRecord};

#[derive(Default)]
pub struct SessionMetadataIndex {
    records: Mutex<HashMap<NoteId, NoteRecord>>,
}

impl SessionMetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataIndex for SessionMetadataIndex {
    fn upsert_note(&self, record: NoteRecord) {
        self.records.lock().unwrap().insert(record.note_id.clone(), record);
    }

    fn get_note(&self, note_id: &NoteId) -> Option<NoteRecord> {
        self.records.lock().unwrap().get(note_id).cloned()
    }

    fn notes_in_sd(&self, sd: &SdId) -> Vec<NoteRecord> {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| &r.sd == sd)
            .cloned()
            .collect()
    }
}
