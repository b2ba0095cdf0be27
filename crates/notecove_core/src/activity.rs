//! Per-instance activity log and gap-aware readers (§4.6 "Activity log").
//!
//! `compact`'s "write replacement under a temp name, rename atomically"
//! step reuses the filesystem layer's durable atomic-write helper. The
//! log itself is a durable, file-based notification channel: peers watch
//! it for new lines rather than receiving a live push.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, ProfileId};

/// One parsed activity line: `noteId|originProfileId|originInstanceId_sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Note the write touched.
    pub note_id: NoteId,
    /// Profile that owns the originating instance.
    pub origin_profile_id: ProfileId,
    /// Instance that performed the write.
    pub origin_instance_id: InstanceId,
    /// Sequence number assigned to that write.
    pub sequence: u64,
}

fn format_line(entry: &ActivityEntry) -> String {
    format!(
        "{}|{}|{}_{}\n",
        entry.note_id, entry.origin_profile_id, entry.origin_instance_id, entry.sequence
    )
}

/// Parse one activity line, rejecting trailing whitespace per §6's
/// grammar (`instanceId` of any length >= 1 is accepted, including the
/// single-byte case called out in §8's boundary behaviors).
pub fn parse_line(line: &str) -> Option<ActivityEntry> {
    let (rest, seq_part) = line.rsplit_once('_')?;
    let (note_part, profile_part) = rest.split_once('|')?;
    let (profile_part, instance_part) = profile_part.split_once('|')?;
    if note_part.is_empty() || profile_part.is_empty() || instance_part.is_empty() {
        return None;
    }
    let sequence: u64 = seq_part.parse().ok()?;
    Some(ActivityEntry {
        note_id: NoteId::new(note_part.to_string())?,
        origin_profile_id: ProfileId::new(profile_part),
        origin_instance_id: InstanceId::new(instance_part),
        sequence,
    })
}

/// Appends and compacts this instance's own activity log.
pub struct ActivityWriter {
    fs: Arc<dyn FileSystem>,
    profile_id: ProfileId,
    instance_id: InstanceId,
    max_size: u64,
    keep_lines: usize,
    lock: Mutex<()>,
}

impl ActivityWriter {
    /// Create a writer for this process's `(profileId, instanceId)` pair.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        profile_id: ProfileId,
        instance_id: InstanceId,
        max_size: u64,
        keep_lines: usize,
    ) -> Self {
        Self {
            fs,
            profile_id,
            instance_id,
            max_size,
            keep_lines,
            lock: Mutex::new(()),
        }
    }

    fn path(&self, sd_root: &Path) -> PathBuf {
        sd_root.join("activity").join(format!(
            "{}.{}.log",
            self.profile_id, self.instance_id
        ))
    }

    /// Append one activity line, compacting first if the file has grown
    /// past `max_size`. Compaction and append share the same lock so
    /// they never interleave (§9 "Compaction during active editing").
    pub fn append(&self, sd_root: &Path, note_id: &NoteId, sequence: u64) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path(sd_root);
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent)?;
        }

        if self.fs.exists(&path) && self.fs.file_len(&path)? > self.max_size {
            self.compact_locked(&path)?;
        }

        let entry = ActivityEntry {
            note_id: note_id.clone(),
            origin_profile_id: self.profile_id.clone(),
            origin_instance_id: self.instance_id.clone(),
            sequence,
        };
        self.fs.append(&path, format_line(&entry).as_bytes())?;
        Ok(())
    }

    fn compact_locked(&self, path: &Path) -> Result<()> {
        let bytes = self.fs.read(path)?;
        let contents = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = contents.lines().collect();
        log::debug!("ActivityWriter: compacting {:?}, keeping last {} lines", path, self.keep_lines);
        let start = lines.len().saturating_sub(self.keep_lines);
        let mut replacement = String::new();
        for line in &lines[start..] {
            replacement.push_str(line);
            replacement.push('\n');
        }
        Ok(self.fs.write_atomic(path, replacement.as_bytes())?)
    }
}

/// Per-`otherInstanceId` watermark tracking a reader's consumption
/// progress through one instance's activity file.
#[derive(Debug, Default)]
pub struct ActivityReader {
    watermarks: Mutex<HashMap<InstanceId, u64>>,
}

/// Outcome of reading one activity file: new entries in order, and
/// whether a gap was detected relative to the reader's watermark.
pub struct ReadOutcome {
    /// Entries with `sequence > watermark`, in file order.
    pub new_entries: Vec<ActivityEntry>,
    /// Set when the minimum sequence seen exceeds `watermark + 1` —
    /// lines were compacted out from under this reader (§4.6, §4.9).
    pub gap: bool,
}

impl ActivityReader {
    /// A fresh reader with no recorded watermarks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark for `instance`, or 0 if never read.
    pub fn watermark_for(&self, instance: &InstanceId) -> u64 {
        *self.watermarks.lock().unwrap().get(instance).unwrap_or(&0)
    }

    /// Read `path` (another instance's activity file named
    /// `<profileId>.<instanceId>.log`), returning entries past this
    /// reader's watermark and flagging a compaction gap per §4.6.
    pub fn read(&self, fs: &dyn FileSystem, path: &Path, instance: &InstanceId) -> Result<ReadOutcome> {
        if !fs.exists(path) {
            return Ok(ReadOutcome {
                new_entries: Vec::new(),
                gap: false,
            });
        }
        let bytes = fs.read(path)?;
        let contents = String::from_utf8_lossy(&bytes);

        let mut watermarks = self.watermarks.lock().unwrap();
        let watermark = *watermarks.get(instance).unwrap_or(&0);

        let mut min_seen: Option<u64> = None;
        let mut max_seen = watermark;
        let mut new_entries = Vec::new();
        for line in contents.lines() {
            let Some(entry) = parse_line(line) else {
                continue;
            };
            if entry.origin_instance_id != *instance {
                continue;
            }
            min_seen = Some(min_seen.map_or(entry.sequence, |m| m.min(entry.sequence)));
            max_seen = max_seen.max(entry.sequence);
            if entry.sequence > watermark {
                new_entries.push(entry);
            }
        }
        new_entries.sort_by_key(|e| e.sequence);

        let gap = min_seen.is_some_and(|min| min > watermark + 1);
        if gap {
            log::warn!(
                "ActivityReader: gap for instance '{}' in {:?}, watermark {} min seen {:?}",
                instance,
                path,
                watermark,
                min_seen
            );
        }

        watermarks.insert(instance.clone(), max_seen);
        Ok(ReadOutcome { new_entries, gap })
    }
}
