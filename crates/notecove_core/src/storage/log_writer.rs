//! Per-note log writer (§4.2 "Per-note storage (writer)").
//!
//! Grounded on `crdt/storage.rs`'s `CrdtStorage` trait shape — an
//! explicit trait boundary over the backing store — but re-specified for
//! rotating log files instead of SQLite rows. The per-note mutex entry in
//! [`FilesystemLogWriter`] *is* the note's write queue: holding the lock
//! for the duration of `write_update` is what makes sequence assignment
//! and rotation atomic per note.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::codec::{self, LOG_MAGIC};
use crate::error::{NoteCoveError, Result};
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, SdId, note_dir};

/// Result of a successful append, matching the vector-clock triple other
/// instances need to reference this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// This instance's id (every write is self-attributed).
    pub instance_id: InstanceId,
    /// Sequence number assigned to this record.
    pub sequence: u64,
    /// Byte offset immediately after this record in `filename`.
    pub offset: u64,
    /// Log file the record was written to.
    pub filename: String,
}

/// Appends local updates to this instance's own per-note log files.
pub trait LogWriter: Send + Sync {
    /// Append `payload` as a new record in `note`'s current log file
    /// under `sd_root`, rotating if needed. Returns the assigned sequence
    /// and position.
    fn write_update(&self, sd_root: &Path, sd: &SdId, note: &NoteId, payload: &[u8])
    -> Result<WriteReceipt>;
}

#[derive(Debug, Clone, Default)]
struct NoteLogState {
    current_filename: Option<String>,
    current_size: u64,
    next_seq: u64,
}

/// [`LogWriter`] backed by a [`FileSystem`] and [`Clock`].
pub struct FilesystemLogWriter {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    instance_id: InstanceId,
    log_max_size: u64,
    state: Mutex<HashMap<(SdId, NoteId), NoteLogState>>,
}

impl FilesystemLogWriter {
    /// Create a writer for this process's instance id.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        instance_id: InstanceId,
        log_max_size: u64,
    ) -> Self {
        Self {
            fs,
            clock,
            instance_id,
            log_max_size,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn logs_dir(&self, sd_root: &Path, note: &NoteId) -> PathBuf {
        note_dir(sd_root, note).join("logs")
    }

    /// Recover this instance's position in `note`'s logs: find our own
    /// most recent log file, repair a truncated tail in place (a crash
    /// mid-append leaves a partial record at the end — §5 "Crash
    /// safety"), and resume `next_seq`/`current_size` from there.
    fn recover(&self, sd_root: &Path, note: &NoteId) -> Result<NoteLogState> {
        let dir = self.logs_dir(sd_root, note);
        if !self.fs.exists(&dir) {
            return Ok(NoteLogState::default());
        }

        let own_suffix = format!("_{}.crdtlog", self.instance_id.as_str());
        let mut own_files: Vec<String> = self
            .fs
            .list_dir(&dir)?
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| e.path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|name| name.ends_with(&own_suffix))
            .collect();
        own_files.sort();

        let Some(filename) = own_files.into_iter().next_back() else {
            return Ok(NoteLogState::default());
        };

        let path = dir.join(&filename);
        let bytes = self.fs.read(&path)?;
        let header_len = codec::parse_header(&path, &bytes, LOG_MAGIC)?;

        let (valid_len, next_seq) = match codec::iterate_log_records(&path, header_len, &bytes[header_len..]) {
            Ok(records) => (bytes.len() as u64, records.last().map(|r| r.sequence).unwrap_or(0)),
            Err(NoteCoveError::Truncated { at_offset, .. }) => {
                let records =
                    codec::iterate_log_records(&path, header_len, &bytes[header_len..at_offset as usize])?;
                (at_offset, records.last().map(|r| r.sequence).unwrap_or(0))
            }
            Err(other) => return Err(other),
        };

        if valid_len != bytes.len() as u64 {
            log::warn!(
                "FilesystemLogWriter: repairing truncated tail in {:?} at offset {}",
                path,
                valid_len
            );
            self.fs.write_atomic(&path, &bytes[..valid_len as usize])?;
        }

        Ok(NoteLogState {
            current_filename: Some(filename),
            current_size: valid_len,
            next_seq,
        })
    }
}

impl LogWriter for FilesystemLogWriter {
    fn write_update(
        &self,
        sd_root: &Path,
        sd: &SdId,
        note: &NoteId,
        payload: &[u8],
    ) -> Result<WriteReceipt> {
        let dir = self.logs_dir(sd_root, note);
        self.fs.create_dir_all(&dir)?;

        let mut state_map = self.state.lock().unwrap();
        let key = (sd.clone(), note.clone());
        if !state_map.contains_key(&key) {
            let recovered = self.recover(sd_root, note)?;
            state_map.insert(key.clone(), recovered);
        }
        let state = state_map.get_mut(&key).unwrap();

        let sequence = state.next_seq + 1;
        let timestamp_ms = self.clock.now_ms();

        let mut record = Vec::new();
        codec::encode_log_record(&mut record, timestamp_ms, sequence, payload);

        let needs_rotation = state.current_filename.is_none()
            || state.current_size + record.len() as u64 > self.log_max_size;

        if needs_rotation {
            let filename = format!("{}_{}.crdtlog", timestamp_ms, self.instance_id.as_str());
            let path = dir.join(&filename);
            log::debug!("FilesystemLogWriter: rotating to {:?}", path);
            let mut header = Vec::new();
            codec::write_header(&mut header, LOG_MAGIC);
            self.fs.write_new(&path, &header)?;
            state.current_filename = Some(filename);
            state.current_size = header.len() as u64;
        }

        let filename = state.current_filename.clone().unwrap();
        let path = dir.join(&filename);
        let offset_before = self.fs.append(&path, &record)?;
        state.current_size = offset_before + record.len() as u64;
        state.next_seq = sequence;

        Ok(WriteReceipt {
            instance_id: self.instance_id.clone(),
            sequence,
            offset: state.current_size,
            filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::fs::InMemoryFileSystem;

    fn writer(instance: &str) -> (FilesystemLogWriter, Arc<InMemoryFileSystem>) {
        let fs = Arc::new(InMemoryFileSystem::new());
        let clock = Arc::new(FakeClock::new(1_000));
        (
            FilesystemLogWriter::new(fs.clone(), clock, InstanceId::new(instance), 1024 * 1024),
            fs,
        )
    }

    #[test]
    fn sequences_increase_without_gaps() {
        let (writer, _fs) = writer("w1");
        let sd = SdId::new("sd-a");
        let note = NoteId::new("note-1").unwrap();
        let root = Path::new("/sd");

        let r1 = writer.write_update(root, &sd, &note, b"a").unwrap();
        let r2 = writer.write_update(root, &sd, &note, b"b").unwrap();
        assert_eq!(r1.sequence, 1);
        assert_eq!(r2.sequence, 2);
        assert_eq!(r1.filename, r2.filename);
    }

    #[test]
    fn rotation_never_splits_a_record() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let clock = Arc::new(FakeClock::new(1));
        // Small threshold forces rotation after the very first record.
        let writer = FilesystemLogWriter::new(fs.clone(), clock.clone(), InstanceId::new("w1"), 10);
        let sd = SdId::new("sd-a");
        let note = NoteId::new("note-1").unwrap();
        let root = Path::new("/sd");

        let r1 = writer.write_update(root, &sd, &note, b"hello").unwrap();
        clock.advance(1);
        let r2 = writer.write_update(root, &sd, &note, b"world").unwrap();
        assert_ne!(r1.filename, r2.filename, "second record should rotate");

        let dir = Path::new("/sd/notes/note-1/logs");
        let path1 = dir.join(&r1.filename);
        let bytes = fs.read(&path1).unwrap();
        let header_len = codec::parse_header(&path1, &bytes, LOG_MAGIC).unwrap();
        let records = codec::iterate_log_records(&path1, header_len, &bytes[header_len..]).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn recovers_next_seq_after_restart() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let clock = Arc::new(FakeClock::new(1_000));
        let sd = SdId::new("sd-a");
        let note = NoteId::new("note-1").unwrap();
        let root = Path::new("/sd");

        {
            let writer =
                FilesystemLogWriter::new(fs.clone(), clock.clone(), InstanceId::new("w1"), 1024);
            writer.write_update(root, &sd, &note, b"a").unwrap();
            writer.write_update(root, &sd, &note, b"b").unwrap();
        }

        let writer2 = FilesystemLogWriter::new(fs, clock, InstanceId::new("w1"), 1024);
        let r3 = writer2.write_update(root, &sd, &note, b"c").unwrap();
        assert_eq!(r3.sequence, 3);
    }

    #[test]
    fn repairs_truncated_tail_before_appending() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let clock = Arc::new(FakeClock::new(1_000));
        let sd = SdId::new("sd-a");
        let note = NoteId::new("note-1").unwrap();
        let root = Path::new("/sd");
        let instance = InstanceId::new("w1");

        let filename;
        {
            let writer = FilesystemLogWriter::new(fs.clone(), clock.clone(), instance.clone(), 1024);
            let r1 = writer.write_update(root, &sd, &note, b"complete").unwrap();
            filename = r1.filename.clone();
        }

        let path = Path::new("/sd/notes/note-1/logs").join(&filename);
        let mut bytes = fs.read(&path).unwrap();
        // Append a bogus partial record (length header claiming more bytes than follow).
        codec::write_varint(&mut bytes, 500);
        bytes.extend_from_slice(b"short");
        fs.write_atomic(&path, &bytes).unwrap();

        let writer2 = FilesystemLogWriter::new(fs.clone(), clock, instance, 1024);
        let r2 = writer2.write_update(root, &sd, &note, b"next").unwrap();
        assert_eq!(r2.sequence, 2);

        // The repaired file must parse cleanly end to end.
        let repaired = fs.read(&path).unwrap();
        let header_len = codec::parse_header(&path, &repaired, LOG_MAGIC).unwrap();
        let records = codec::iterate_log_records(&path, header_len, &repaired[header_len..]).unwrap();
        assert_eq!(records.len(), 2);
    }
}
