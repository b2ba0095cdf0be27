//! The public `Engine` handle (§6 "API exposed to external collaborators").
//!
//! Ties together every component above into the single object an
//! application embeds: one [`Engine`] per process, one registered SD per
//! storage directory the user has opened. Grounded on
//! `diaryx_core::workspace`'s "construction takes the collaborators it
//! needs, registration does the I/O" shape, and on `sync_handler.rs`'s
//! role as the single place remote-update side effects funnel through —
//! here, that role is split across the watcher, the reload pipeline, and
//! the note manager, with `Engine` as the thing that wires them together
//! and owns their background scheduling loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use yrs::Subscription;

use crate::activity::{ActivityReader, ActivityWriter};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{NoteCoveError, Result};
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, ProfileId, SdId};
use crate::metadata_index::{MetadataIndex, NoteRecord};
use crate::note_manager::NoteManager;
use crate::reload::{ReloadPipeline, StaleSync};
use crate::sd::{self, PresenceWriter};
use crate::storage::{FilesystemLogWriter, LogWriter, SnapshotManager};
use crate::watcher::{NativeWatcher, PollWatcher, WatchEvent, WatchEventKind, work_queue};

/// Everything the background scheduler needs for one registered SD.
struct RegisteredSd {
    sd: SdId,
    sd_root: PathBuf,
    note_manager: Arc<NoteManager>,
    reload: Arc<ReloadPipeline>,
    presence: Arc<PresenceWriter>,
    activity_reader: Arc<ActivityReader>,
    metadata_index: Arc<dyn MetadataIndex>,
    poll_watcher: Arc<PollWatcher>,
    // Kept alive for as long as the SD is registered; dropping it stops
    // the OS-level watch.
    _native_watcher: Option<NativeWatcher>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

/// The public handle applications construct and hold for the lifetime of
/// the process. Exposes exactly the API in §6: `register_sd`,
/// `unregister_sd`, `apply_local_update`, `read_state`, `observe_state`,
/// `create_snapshot`, `force_reload_from_logs`, `get_stale_syncs`,
/// `skip_stale`, `retry_stale`.
pub struct Engine {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    instance_id: InstanceId,
    profile_id: ProfileId,
    runtime: tokio::runtime::Runtime,
    sds: Mutex<HashMap<SdId, Arc<RegisteredSd>>>,
}

/// Profile display fields written into `profiles/<profileId>.json`
/// (§3 "Profile presence"); everything beyond the id is informational.
#[derive(Debug, Clone)]
pub struct ProfileInfo {
    /// Human-readable display name.
    pub profile_name: String,
    /// Local OS username.
    pub username: String,
    /// User-chosen handle, if set.
    pub handle: Option<String>,
    /// Hostname of the machine running this instance.
    pub hostname: String,
    /// Platform identifier (e.g. "linux", "macos", "windows").
    pub platform: String,
}

impl Engine {
    /// Construct an engine. Takes the `FileSystem`/`Clock` trait objects
    /// so the whole engine can be driven deterministically in tests (§9).
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        instance_id: InstanceId,
        profile_id: ProfileId,
        config: EngineConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(NoteCoveError::Io)?;
        Ok(Self {
            fs,
            clock,
            config,
            instance_id,
            profile_id,
            runtime,
            sds: Mutex::new(HashMap::new()),
        })
    }

    /// Register a storage directory: create/adopt its `SD_ID`/`SD_VERSION`
    /// (§4.10), start its native watcher and poll backstop, write an
    /// initial presence heartbeat, and spawn the background scheduler
    /// that drives reload retries, catch-up, and periodic heartbeats.
    pub fn register_sd(
        &self,
        path: &Path,
        profile: ProfileInfo,
        metadata_index: Arc<dyn MetadataIndex>,
    ) -> Result<SdId> {
        let identity = sd::register(self.fs.as_ref(), path)?;
        let sd = SdId::new(identity.id);

        let log_writer: Arc<dyn LogWriter> = Arc::new(FilesystemLogWriter::new(
            self.fs.clone(),
            self.clock.clone(),
            self.instance_id.clone(),
            self.config.log_max_size,
        ));
        let activity = Arc::new(ActivityWriter::new(
            self.fs.clone(),
            self.profile_id.clone(),
            self.instance_id.clone(),
            self.config.activity_max_size,
            self.config.activity_keep,
        ));
        let note_manager = Arc::new(NoteManager::new(
            self.fs.clone(),
            self.clock.clone(),
            path.to_path_buf(),
            sd.clone(),
            self.instance_id.clone(),
            log_writer,
            activity,
            self.config.note_cache_size,
        ));
        let reload = Arc::new(ReloadPipeline::new(
            self.clock.clone(),
            self.config.reload_backoff_initial_ms,
            self.config.reload_backoff_max_ms,
            self.config.reload_budget_ms,
        ));
        let presence = Arc::new(PresenceWriter::new(
            self.fs.clone(),
            self.clock.clone(),
            self.profile_id.clone(),
            profile.profile_name,
            profile.username,
            profile.handle,
            profile.hostname,
            profile.platform,
        ));
        presence.heartbeat(path)?;

        let poll_watcher = Arc::new(PollWatcher::new(self.fs.clone(), self.clock.clone()));
        let (tx, rx) = work_queue(256);
        let native_watcher = NativeWatcher::start(
            sd.clone(),
            path,
            Duration::from_millis(self.config.debounce_window_ms),
            tx,
        )
        .inspect_err(|e| log::warn!("native watcher unavailable for {path:?}, relying on poll backstop: {e}"))
        .ok();

        let registered = Arc::new(RegisteredSd {
            sd: sd.clone(),
            sd_root: path.to_path_buf(),
            note_manager,
            reload,
            presence,
            activity_reader: Arc::new(ActivityReader::new()),
            metadata_index,
            poll_watcher,
            _native_watcher: native_watcher,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });

        self.sds.lock().unwrap().insert(sd.clone(), registered.clone());
        self.spawn_background_loop(registered, rx);

        Ok(sd)
    }

    fn spawn_background_loop(&self, registered: Arc<RegisteredSd>, rx: std::sync::mpsc::Receiver<WatchEvent>) {
        let config = self.config.clone();
        let clock = self.clock.clone();
        self.runtime.spawn(async move {
            let mut last_poll = clock.now_ms();
            let mut last_presence = clock.now_ms();

            loop {
                if registered.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }

                while let Ok(event) = rx.try_recv() {
                    handle_watch_event(&registered, &event);
                }

                let now = clock.now_ms();
                if now - last_poll >= config.poll_interval_ms as i64 {
                    last_poll = now;
                    for event in registered.poll_watcher.poll_once(&registered.sd, &registered.sd_root) {
                        handle_watch_event(&registered, &event);
                    }
                }
                if now - last_presence >= config.presence_interval_ms as i64 {
                    last_presence = now;
                    if let Err(e) = registered.presence.heartbeat(&registered.sd_root) {
                        log::warn!("presence heartbeat failed for {:?}: {e}", registered.sd_root);
                    }
                }

                for (note, origin, generation) in registered.reload.due_retries() {
                    attempt_reload(&registered, &note, &origin, generation);
                }

                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    /// Stop watching and heartbeating a storage directory. Cached
    /// documents are dropped; files on disk are untouched.
    pub fn unregister_sd(&self, sd: &SdId) {
        if let Some(registered) = self.sds.lock().unwrap().remove(sd) {
            registered.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn registered(&self, sd: &SdId) -> Result<Arc<RegisteredSd>> {
        self.sds
            .lock()
            .unwrap()
            .get(sd)
            .cloned()
            .ok_or_else(|| NoteCoveError::SdNotRegistered(PathBuf::new()))
    }

    /// Apply a local edit: replaces the note's body with `content` (§6).
    /// Mirrors the resulting title metadata into the registered
    /// [`MetadataIndex`] so external collaborators stay in sync with
    /// local edits (§4 "Metadata index is owned by an external
    /// collaborator" — this is the one place the engine writes to it).
    pub fn apply_local_update(&self, sd: &SdId, note: &NoteId, content: &str) -> Result<u64> {
        let registered = self.registered(sd)?;
        let sequence = registered.note_manager.apply_local(note, content)?;
        if let Ok(doc) = registered.note_manager.get_or_load(note) {
            registered.metadata_index.upsert_note(NoteRecord {
                note_id: note.clone(),
                sd: registered.sd.clone(),
                title: doc.get_metadata("title"),
            });
        }
        Ok(sequence)
    }

    /// Read a note's current merged body text (§6).
    pub fn read_state(&self, sd: &SdId, note: &NoteId) -> Result<String> {
        self.registered(sd)?.note_manager.read_body(note)
    }

    /// Subscribe to a note's body changes (§6).
    pub fn observe_state<F>(&self, sd: &SdId, note: &NoteId, callback: F) -> Result<Subscription>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let doc = self.registered(sd)?.note_manager.get_or_load(note)?;
        Ok(doc.observe(callback))
    }

    /// Force an immediate snapshot write for `note` (§4.3, §6).
    pub fn create_snapshot(&self, sd: &SdId, note: &NoteId) -> Result<PathBuf> {
        let registered = self.registered(sd)?;
        let doc = registered.note_manager.get_or_load(note)?;
        let snapshots = SnapshotManager::new(self.fs.clone(), self.instance_id.clone());
        snapshots.write_snapshot(
            &registered.sd_root,
            note,
            self.clock.now_ms(),
            &doc.vector_clock(),
            &doc.encode_state(),
        )
    }

    /// Force a reload attempt for `note` right now, bypassing any pending
    /// backoff (§6, §4.9).
    pub fn force_reload_from_logs(&self, sd: &SdId, note: &NoteId) -> Result<()> {
        let registered = self.registered(sd)?;
        registered.note_manager.catch_up(note)?;
        Ok(())
    }

    /// Notes currently published as stale (retry budget exhausted) for
    /// `sd` (§6).
    pub fn get_stale_syncs(&self, sd: &SdId) -> Result<Vec<StaleSync>> {
        Ok(self.registered(sd)?.reload.stale_syncs())
    }

    /// Dismiss a stale sync without retrying (§6).
    pub fn skip_stale(&self, sd: &SdId, note: &NoteId, origin: &InstanceId) -> Result<()> {
        self.registered(sd)?.reload.skip_stale(note, origin);
        Ok(())
    }

    /// Reopen a stale sync for another attempt (§6).
    pub fn retry_stale(&self, sd: &SdId, note: &NoteId, origin: &InstanceId) -> Result<()> {
        self.registered(sd)?.reload.retry_stale(note, origin);
        self.force_reload_from_logs(sd, note)
    }
}

fn note_id_from_path(path: &Path) -> Option<NoteId> {
    let components: Vec<&std::ffi::OsStr> = path.components().map(|c| c.as_os_str()).collect();
    let notes_idx = components.iter().position(|c| *c == "notes")?;
    let raw = components.get(notes_idx + 1)?.to_str()?;
    NoteId::new(raw)
}

fn handle_watch_event(registered: &Arc<RegisteredSd>, event: &WatchEvent) {
    match event.kind() {
        WatchEventKind::Logs | WatchEventKind::Snapshots => {
            if let Some(note) = note_id_from_path(event.path()) {
                if registered.note_manager.is_loaded(&note) {
                    let _ = registered.note_manager.catch_up(&note);
                }
            }
        }
        WatchEventKind::Activity => {
            let Some(instance_str) = event
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('.').nth(1))
            else {
                return;
            };
            let other = InstanceId::new(instance_str);
            if other == *registered.note_manager.instance_id() {
                // This instance's own activity file — nothing to reload
                // against itself (§4.8 point 1).
                return;
            }
            let fs = registered.note_manager.fs().as_ref();
            let Ok(outcome) = registered.activity_reader.read(fs, event.path(), &other) else {
                return;
            };
            if outcome.gap {
                // Lines were compacted out from under this reader before
                // it saw them; fall back to reloading every known note
                // against this origin rather than trusting `new_entries`
                // alone (§4.9 point 2).
                let watermark = registered.activity_reader.watermark_for(&other);
                for record in registered.metadata_index.notes_in_sd(&registered.sd) {
                    registered.reload.request(&record.note_id, &other, watermark);
                }
            }
            for entry in outcome.new_entries {
                registered.reload.request(&entry.note_id, &other, entry.sequence);
            }
        }
    }
}

/// One scheduler tick's attempt to bring `note` up to `target_seq` from
/// `origin`: rescan the logs, then check whether the note's own vector
/// clock now covers the target (§4.9).
fn attempt_reload(registered: &Arc<RegisteredSd>, note: &NoteId, origin: &InstanceId, generation: u64) {
    if registered.note_manager.catch_up(note).is_err() {
        registered.reload.record_not_found(note, origin, generation, 0);
        return;
    }

    let caught_up = registered
        .note_manager
        .get_or_load(note)
        .map(|doc| doc.vector_clock().sequence_for(origin))
        .unwrap_or(0);
    let target = registered.reload.target_seq_of(note, origin).unwrap_or(caught_up);

    if caught_up >= target {
        registered.reload.record_found(note, origin, generation);
    } else {
        registered.reload.record_not_found(note, origin, generation, caught_up);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityWriter;
    use crate::clock::FakeClock;
    use crate::fs::InMemoryFileSystem;
    use crate::metadata_index::{InMemoryMetadataIndex, NoteRecord};
    use crate::storage::FilesystemLogWriter;

    fn registered_sd(fs: Arc<dyn FileSystem>, clock: Arc<dyn Clock>, sd: SdId, instance: &str) -> Arc<RegisteredSd> {
        let instance_id = InstanceId::new(instance);
        let log_writer: Arc<dyn LogWriter> = Arc::new(FilesystemLogWriter::new(
            fs.clone(),
            clock.clone(),
            instance_id.clone(),
            1024 * 1024,
        ));
        let activity = Arc::new(ActivityWriter::new(
            fs.clone(),
            ProfileId::new("p1"),
            instance_id.clone(),
            1024 * 1024,
            2000,
        ));
        let note_manager = Arc::new(NoteManager::new(
            fs.clone(),
            clock.clone(),
            PathBuf::from("/sd"),
            sd.clone(),
            instance_id,
            log_writer,
            activity,
            64,
        ));
        let reload = Arc::new(ReloadPipeline::new(clock.clone(), 250, 30_000, 60_000));
        let presence = Arc::new(PresenceWriter::new(
            fs.clone(),
            clock.clone(),
            ProfileId::new("p1"),
            "Name".to_string(),
            "user".to_string(),
            None,
            "host".to_string(),
            "linux".to_string(),
        ));
        Arc::new(RegisteredSd {
            sd,
            sd_root: PathBuf::from("/sd"),
            note_manager,
            reload,
            presence,
            activity_reader: Arc::new(ActivityReader::new()),
            metadata_index: Arc::new(InMemoryMetadataIndex::new()),
            poll_watcher: Arc::new(PollWatcher::new(fs, clock)),
            _native_watcher: None,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    #[test]
    fn activity_event_for_own_instance_is_ignored() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
        let sd = SdId::new("sd-a");
        let registered = registered_sd(fs.clone(), clock, sd.clone(), "self-1");

        let path = PathBuf::from("/sd/activity/p1.self-1.log");
        fs.write_new(&path, b"n1|p1|self-1_1\n").unwrap();

        let event = WatchEvent::for_test(sd.clone(), path, WatchEventKind::Activity);
        handle_watch_event(&registered, &event);

        let note = NoteId::new("n1").unwrap();
        assert_eq!(
            registered.reload.state_of(&note, &InstanceId::new("self-1")),
            None,
            "a local instance's own activity must never schedule a reload against itself"
        );
    }

    #[test]
    fn activity_event_for_other_instance_schedules_reload() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
        let sd = SdId::new("sd-a");
        let registered = registered_sd(fs.clone(), clock, sd.clone(), "self-1");

        let path = PathBuf::from("/sd/activity/p1.peer-1.log");
        fs.write_new(&path, b"n1|p1|peer-1_1\n").unwrap();

        let event = WatchEvent::for_test(sd, path, WatchEventKind::Activity);
        handle_watch_event(&registered, &event);

        let note = NoteId::new("n1").unwrap();
        assert!(registered.reload.state_of(&note, &InstanceId::new("peer-1")).is_some());
    }

    #[test]
    fn activity_gap_triggers_full_scan_fallback_over_metadata_index() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000));
        let sd = SdId::new("sd-a");
        let registered = registered_sd(fs.clone(), clock, sd.clone(), "self-1");

        let n1 = NoteId::new("n1").unwrap();
        let n2 = NoteId::new("n2").unwrap();
        registered.metadata_index.upsert_note(NoteRecord {
            note_id: n1.clone(),
            sd: sd.clone(),
            title: None,
        });
        registered.metadata_index.upsert_note(NoteRecord {
            note_id: n2.clone(),
            sd: sd.clone(),
            title: None,
        });

        let path = PathBuf::from("/sd/activity/p1.peer-1.log");
        // Seed the reader's watermark at 1, then present a file whose
        // minimum sequence is far past it — simulating lines compacted
        // out from under this reader before it ever saw them.
        fs.write_new(&path, b"n1|p1|peer-1_1\n").unwrap();
        registered
            .activity_reader
            .read(fs.as_ref(), &path, &InstanceId::new("peer-1"))
            .unwrap();
        let mut lines = String::new();
        for seq in 501..=510 {
            lines.push_str(&format!("n1|p1|peer-1_{seq}\n"));
        }
        fs.write_atomic(&path, lines.as_bytes()).unwrap();

        let event = WatchEvent::for_test(sd, path, WatchEventKind::Activity);
        handle_watch_event(&registered, &event);

        // Every note in the metadata index gets a reload request, not
        // just the one with a directly-visible activity line.
        assert!(registered.reload.state_of(&n1, &InstanceId::new("peer-1")).is_some());
        assert!(registered.reload.state_of(&n2, &InstanceId::new("peer-1")).is_some());
    }
}
