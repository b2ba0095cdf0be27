//! End-to-end sync scenarios across the storage/note_manager/watcher
//! layers, exercised against an in-memory filesystem and fake clock so
//! nothing here depends on real time or real disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notecove_core::activity::{ActivityReader, ActivityWriter};
use notecove_core::clock::{Clock, FakeClock};
use notecove_core::codec;
use notecove_core::fs::{FileSystem, InMemoryFileSystem};
use notecove_core::ids::{InstanceId, NoteId, ProfileId, SdId};
use notecove_core::note_manager::NoteManager;
use notecove_core::storage::{FilesystemLogWriter, LogWriter};

fn manager(
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    sd: &SdId,
    instance: &str,
) -> NoteManager {
    let instance_id = InstanceId::new(instance);
    let log_writer = Arc::new(FilesystemLogWriter::new(
        fs.clone(),
        clock.clone(),
        instance_id.clone(),
        1024 * 1024,
    ));
    let activity = Arc::new(ActivityWriter::new(
        fs.clone(),
        ProfileId::new("p1"),
        instance_id.clone(),
        64 * 1024,
        2000,
    ));
    NoteManager::new(
        fs,
        clock,
        PathBuf::from("/sd"),
        sd.clone(),
        instance_id,
        log_writer,
        activity,
        64,
    )
}

/// S1 — two instances converge on the same note purely by exchanging
/// log/activity files through a shared filesystem.
#[test]
fn basic_sync_converges_both_instances() {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
    let sd = SdId::new("sd-a");
    let note = NoteId::new("n1").unwrap();

    let a = manager(fs.clone(), clock.clone(), &sd, "a");
    let b = manager(fs.clone(), clock.clone(), &sd, "b");

    let seq1 = a.apply_local(&note, "hello").unwrap();
    assert_eq!(seq1, 1);
    b.catch_up(&note).unwrap();
    assert_eq!(b.read_body(&note).unwrap(), "hello");

    let seq2 = a.apply_local(&note, "hello world").unwrap();
    assert_eq!(seq2, 2);
    b.catch_up(&note).unwrap();
    assert_eq!(b.read_body(&note).unwrap(), "hello world");

    let a_doc = a.get_or_load(&note).unwrap();
    let b_doc = b.get_or_load(&note).unwrap();
    assert_eq!(a_doc.vector_clock().sequence_for(&InstanceId::new("a")), 2);
    assert_eq!(b_doc.vector_clock().sequence_for(&InstanceId::new("a")), 2);
}

/// S3 — a truncated tail on the current log is tolerated; the complete
/// prefix is applied and the rest catches up once the bytes arrive.
#[test]
fn truncated_log_tail_is_tolerated_until_completed() {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
    let sd = SdId::new("sd-a");
    let note = NoteId::new("n1").unwrap();

    let writer = FilesystemLogWriter::new(fs.clone(), clock.clone(), InstanceId::new("a"), 1024 * 1024);
    let sd_root = Path::new("/sd");

    let origin_doc = notecove_core::crdt::DocumentSnapshot::new();
    let update1 = origin_doc.apply_local("first");
    let r1 = writer.write_update(sd_root, &sd, &note, &update1).unwrap();

    // Build record 2's well-formed bytes, but only let its first half
    // land on disk — simulating an append that crashed partway through.
    let update2 = origin_doc.apply_local("first and second");
    let mut record2 = Vec::new();
    codec::encode_log_record(&mut record2, 1_000, 2, &update2);
    let half = record2.len() / 2;

    let path = Path::new("/sd/notes/n1/logs").join(&r1.filename);
    let mut bytes = fs.read(&path).unwrap();
    bytes.extend_from_slice(&record2[..half]);
    fs.write_atomic(&path, &bytes).unwrap();

    let reader = manager(fs.clone(), clock.clone(), &sd, "reader");
    assert_eq!(reader.read_body(&note).unwrap(), "first");

    // The rest of record 2's bytes arrive.
    bytes.extend_from_slice(&record2[half..]);
    fs.write_atomic(&path, &bytes).unwrap();

    reader.catch_up(&note).unwrap();
    assert_eq!(reader.read_body(&note).unwrap(), "first and second");
}

/// S4 — activity-log compaction that drops lines out from under a reader
/// is detected as a gap rather than silently skipping updates.
#[test]
fn activity_compaction_is_detected_as_a_gap() {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let writer = ActivityWriter::new(fs.clone(), ProfileId::new("p1"), InstanceId::new("a"), 1024 * 1024, 2000);
    let sd_root = Path::new("/sd");
    let note = NoteId::new("n1").unwrap();
    let path = sd_root.join("activity").join("p1.a.log");

    writer.append(sd_root, &note, 1).unwrap();
    let reader = ActivityReader::new();
    reader.read(fs.as_ref(), &path, &InstanceId::new("a")).unwrap();

    // Compaction drops everything below 501, as if 2500 lines had
    // accumulated and only the last 2000 survived.
    let mut lines = String::new();
    for seq in 501..=520 {
        lines.push_str(&format!("n1|p1|a_{seq}\n"));
    }
    fs.write_atomic(&path, lines.as_bytes()).unwrap();

    let outcome = reader.read(fs.as_ref(), &path, &InstanceId::new("a")).unwrap();
    assert!(outcome.gap, "reader should detect the compacted range as a gap");
}

/// S5 — concurrent local writes against the same note serialize through
/// the per-note FIFO queue instead of racing each other into a
/// `SequenceViolation`.
#[test]
fn concurrent_local_writes_never_violate_sequence_order() {
    let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
    let sd = SdId::new("sd-a");
    let mgr = Arc::new(manager(fs, clock, &sd, "w1"));
    let note = NoteId::new("n1").unwrap();

    let handles: Vec<_> = (1..=8)
        .map(|i| {
            let mgr = mgr.clone();
            let note = note.clone();
            std::thread::spawn(move || mgr.apply_local(&note, &format!("edit {i}")))
        })
        .collect();

    let mut sequences: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());
}
