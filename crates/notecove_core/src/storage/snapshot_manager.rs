//! Snapshot writing and garbage collection (§4.3 "Snapshot manager").
//!
//! The two-phase incomplete→complete write is the same durable-write
//! idiom `fs/native.rs`'s atomic-rename helpers use, generalized from
//! "write temp + rename" to "write incomplete + flip status byte" since a
//! snapshot is a single growing file rather than a temp-then-rename pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{self, SNAPSHOT_COMPLETE, SNAPSHOT_INCOMPLETE, SNAPSHOT_MAGIC, VectorClockEntryBytes};
use crate::crdt::VectorClock;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, note_dir};

fn clock_to_entries(clock: &VectorClock) -> Vec<VectorClockEntryBytes> {
    clock
        .iter()
        .map(|(id, entry)| VectorClockEntryBytes {
            instance_id: id.as_str().to_string(),
            sequence: entry.sequence,
            offset: entry.offset,
            filename: entry.filename.clone(),
        })
        .collect()
}

/// True if `candidate` is dominated by `reference`: every instance
/// tracked by `candidate` is covered by an equal-or-later sequence in
/// `reference`. A dominated snapshot carries no information `reference`
/// doesn't already subsume and is safe to delete.
fn is_dominated(candidate: &[VectorClockEntryBytes], reference: &[VectorClockEntryBytes]) -> bool {
    candidate.iter().all(|c| {
        reference
            .iter()
            .any(|r| r.instance_id == c.instance_id && r.sequence >= c.sequence)
    })
}

/// A parsed snapshot file: its vector clock and encoded document state.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// Full path on disk.
    pub path: PathBuf,
    /// Vector clock entries encoded in the snapshot header.
    pub clock_entries: Vec<VectorClockEntryBytes>,
    /// Encoded CRDT document state.
    pub doc_state: Vec<u8>,
}

/// Writes and garbage-collects per-note snapshot files.
pub struct SnapshotManager {
    fs: Arc<dyn FileSystem>,
    instance_id: InstanceId,
}

impl SnapshotManager {
    /// Create a manager that writes snapshots attributed to `instance_id`.
    pub fn new(fs: Arc<dyn FileSystem>, instance_id: InstanceId) -> Self {
        Self { fs, instance_id }
    }

    fn snapshots_dir(&self, sd_root: &Path, note: &NoteId) -> PathBuf {
        note_dir(sd_root, note).join("snapshots")
    }

    /// Write a new snapshot for `note`, then delete any existing snapshot
    /// it strictly dominates.
    pub fn write_snapshot(
        &self,
        sd_root: &Path,
        note: &NoteId,
        timestamp_ms: i64,
        clock: &VectorClock,
        doc_state: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.snapshots_dir(sd_root, note);
        self.fs.create_dir_all(&dir)?;

        let filename = format!("{}_{}.snapshot", timestamp_ms, self.instance_id.as_str());
        let path = dir.join(&filename);

        let entries = clock_to_entries(clock);

        let mut incomplete = Vec::new();
        codec::write_header(&mut incomplete, SNAPSHOT_MAGIC);
        incomplete.push(SNAPSHOT_INCOMPLETE);
        codec::encode_vector_clock(&mut incomplete, &entries);
        incomplete.extend_from_slice(doc_state);
        self.fs.write_new(&path, &incomplete)?;

        let mut complete = incomplete;
        complete[5] = SNAPSHOT_COMPLETE; // status byte follows the 5-byte header
        self.fs.write_atomic(&path, &complete)?;

        for existing in self.list_snapshots(sd_root, note)? {
            if existing.path == path {
                continue;
            }
            if is_dominated(&existing.clock_entries, &entries) {
                let _ = self.fs.remove_file(&existing.path);
            }
        }

        Ok(path)
    }

    /// Parse every snapshot file present for `note`, skipping ones still
    /// marked incomplete (a concurrent writer hasn't finished).
    pub fn list_snapshots(&self, sd_root: &Path, note: &NoteId) -> Result<Vec<SnapshotFile>> {
        let dir = self.snapshots_dir(sd_root, note);
        if !self.fs.exists(&dir) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in self.fs.list_dir(&dir)? {
            if entry.is_dir {
                continue;
            }
            let bytes = self.fs.read(&entry.path)?;
            let header_len = match codec::parse_header(&entry.path, &bytes, SNAPSHOT_MAGIC) {
                Ok(len) => len,
                Err(_) => continue,
            };
            if bytes.len() <= header_len {
                continue;
            }
            let status = bytes[header_len];
            if status != SNAPSHOT_COMPLETE {
                continue;
            }
            let mut cursor = std::io::Cursor::new(&bytes[header_len + 1..]);
            let Some(clock_entries) = codec::decode_vector_clock(&mut cursor) else {
                continue;
            };
            let state_start = header_len + 1 + cursor.position() as usize;
            out.push(SnapshotFile {
                path: entry.path,
                clock_entries,
                doc_state: bytes[state_start..].to_vec(),
            });
        }
        Ok(out)
    }

    /// Find the snapshot whose vector clock dominates all others (the
    /// most advanced complete snapshot), if any.
    pub fn maximal_snapshot(&self, sd_root: &Path, note: &NoteId) -> Result<Option<SnapshotFile>> {
        let snapshots = self.list_snapshots(sd_root, note)?;
        Ok(snapshots
            .into_iter()
            .max_by_key(|s| s.clock_entries.iter().map(|e| e.sequence).sum::<u64>()))
    }

    /// Delete log files fully subsumed by `reference` clock entries,
    /// except any path in `exclude` (the log currently open for write).
    pub fn gc_logs(
        &self,
        sd_root: &Path,
        note: &NoteId,
        reference: &[VectorClockEntryBytes],
        exclude: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        use crate::codec::LOG_MAGIC;

        let dir = note_dir(sd_root, note).join("logs");
        if !self.fs.exists(&dir) {
            return Ok(Vec::new());
        }

        let mut deleted = Vec::new();
        for entry in self.fs.list_dir(&dir)? {
            if entry.is_dir || exclude.contains(&entry.path) {
                continue;
            }
            let bytes = self.fs.read(&entry.path)?;
            let Ok(header_len) = codec::parse_header(&entry.path, &bytes, LOG_MAGIC) else {
                continue;
            };
            let records = match codec::iterate_log_records(&entry.path, header_len, &bytes[header_len..]) {
                Ok(records) => records,
                Err(_) => continue,
            };
            let Some(instance_id) = filename_instance_id(&entry.path) else {
                continue;
            };
            let covered = reference
                .iter()
                .find(|e| e.instance_id == instance_id)
                .map(|e| e.sequence)
                .unwrap_or(0);
            let fully_covered = records.iter().all(|r| r.sequence <= covered);
            if fully_covered && !records.is_empty() {
                if self.fs.remove_file(&entry.path).is_ok() {
                    deleted.push(entry.path);
                }
            }
        }
        Ok(deleted)
    }
}

fn filename_instance_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".crdtlog")?;
    let (_, instance) = stem.split_once('_')?;
    Some(instance.to_string())
}
