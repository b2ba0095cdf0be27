//! Per-SD note cache and serialization (§4.7 "Note manager").
//!
//! Grounded on `crdt/body_doc_manager.rs`'s `BodyDocManager`: the same
//! `RwLock<HashMap<_, Arc<_>>>` cache shape and `get_or_create`/
//! `is_loaded`/`unload`/`loaded_docs` surface, generalized from an
//! unbounded map to a size-bounded LRU and from synchronous-only access
//! to a per-note FIFO queue (§9 "Per-note FIFO queues") — `BodyDocManager`
//! leaves its single-writer-per-doc assumption implicit; here it must be
//! explicit and must survive a failing operation without wedging the
//! queue for the next one (§8 S5).

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crate::activity::ActivityWriter;
use crate::clock::Clock;
use crate::crdt::DocumentSnapshot;
use crate::error::{NoteCoveError, Result};
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, SdId};
use crate::storage::{Loader, LogWriter};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single-consumer FIFO for one note. Holding no lock longer than one
/// job's execution is what makes per-note serialization explicit instead
/// of implicit in caller discipline.
struct NoteQueue {
    sender: mpsc::Sender<Job>,
}

impl NoteQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        thread::spawn(move || {
            for job in receiver {
                // A panicking job must not poison the queue for the next
                // one (§8 S5: a failing operation is rejected, not fatal).
                let _ = panic::catch_unwind(AssertUnwindSafe(job));
            }
        });
        Self { sender }
    }

    fn enqueue(&self, job: Job) {
        let _ = self.sender.send(job);
    }
}

/// Bounded least-recently-used cache of loaded documents, generalizing
/// `BodyDocManager`'s unbounded `docs` map per §4.7.
struct LruCache {
    capacity: usize,
    order: VecDeque<NoteId>,
    docs: HashMap<NoteId, Arc<DocumentSnapshot>>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            docs: HashMap::new(),
        }
    }

    fn touch(&mut self, note: &NoteId) {
        if let Some(pos) = self.order.iter().position(|n| n == note) {
            self.order.remove(pos);
        }
        self.order.push_back(note.clone());
    }

    fn get(&mut self, note: &NoteId) -> Option<Arc<DocumentSnapshot>> {
        let doc = self.docs.get(note).cloned();
        if doc.is_some() {
            self.touch(note);
        }
        doc
    }

    fn insert(&mut self, note: NoteId, doc: Arc<DocumentSnapshot>) {
        self.docs.insert(note.clone(), doc);
        self.touch(&note);
        while self.docs.len() > self.capacity {
            if let Some(evict) = self.order.pop_front() {
                self.docs.remove(&evict);
            } else {
                break;
            }
        }
    }

    fn remove(&mut self, note: &NoteId) -> Option<Arc<DocumentSnapshot>> {
        self.order.retain(|n| n != note);
        self.docs.remove(note)
    }

    fn loaded(&self) -> Vec<NoteId> {
        self.docs.keys().cloned().collect()
    }
}

/// Orchestrates C3–C7 for every note in one storage directory: the cache
/// of live [`DocumentSnapshot`]s, the per-note FIFO queues, and the
/// writer/loader/activity collaborators that back them.
pub struct NoteManager {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    sd_root: PathBuf,
    sd: SdId,
    instance_id: InstanceId,
    log_writer: Arc<dyn LogWriter>,
    loader: Arc<Loader>,
    activity: Arc<ActivityWriter>,
    cache: RwLock<LruCache>,
    queues: Mutex<HashMap<NoteId, Arc<NoteQueue>>>,
}

impl NoteManager {
    /// Construct a manager for one SD. `note_cache_size` bounds the LRU
    /// (§4.7, config-driven).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        sd_root: PathBuf,
        sd: SdId,
        instance_id: InstanceId,
        log_writer: Arc<dyn LogWriter>,
        activity: Arc<ActivityWriter>,
        note_cache_size: usize,
    ) -> Self {
        let loader = Arc::new(Loader::new(fs.clone(), instance_id.clone()));
        Self {
            fs,
            clock,
            sd_root,
            sd,
            instance_id,
            log_writer,
            loader,
            activity,
            cache: RwLock::new(LruCache::new(note_cache_size.max(1))),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queue_for(&self, note: &NoteId) -> Arc<NoteQueue> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(note.clone())
            .or_insert_with(|| Arc::new(NoteQueue::new()))
            .clone()
    }

    /// Run `job` on `note`'s FIFO and block for its result.
    fn run_serialized<T, F>(&self, note: &NoteId, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.queue_for(note).enqueue(Box::new(move || {
            let _ = tx.send(job());
        }));
        rx.recv().map_err(|_| {
            NoteCoveError::Crdt("note queue consumer dropped without a reply".to_string())
        })?
    }

    /// Return the cached document for `note`, loading it from disk
    /// (§4.5) if it isn't currently cached.
    pub fn get_or_load(&self, note: &NoteId) -> Result<Arc<DocumentSnapshot>> {
        if let Some(doc) = self.cache.write().unwrap().get(note) {
            return Ok(doc);
        }
        let loaded = self.loader.load(&self.sd_root, note)?;
        let doc = Arc::new(loaded.doc);
        for tail in &loaded.truncated {
            log::debug!(
                "note_manager: truncated tail in {:?} at offset {} for note {note}, will retry on next reload",
                tail.path,
                tail.at_offset
            );
        }
        self.cache.write().unwrap().insert(note.clone(), doc.clone());
        Ok(doc)
    }

    /// Evict `note` from the cache without touching disk (§3 "released
    /// after an idle window; may be recreated from disk at any time").
    pub fn unload(&self, note: &NoteId) -> Option<Arc<DocumentSnapshot>> {
        self.cache.write().unwrap().remove(note)
    }

    /// Whether `note` currently has a live cached document.
    pub fn is_loaded(&self, note: &NoteId) -> bool {
        self.cache.write().unwrap().get(note).is_some()
    }

    /// All currently cached note ids.
    pub fn loaded_notes(&self) -> Vec<NoteId> {
        self.cache.read().unwrap().loaded()
    }

    /// Apply a local edit: enqueued on the note's FIFO so concurrent
    /// dispatches from the UI serialize in arrival order (§8 S5).
    /// Replaces the whole body with `content`, appends the resulting
    /// update to this instance's log, advances the document's own clock
    /// position, and records an activity line for peers to observe.
    pub fn apply_local(&self, note: &NoteId, content: &str) -> Result<u64> {
        let doc = self.get_or_load(note)?;
        let note = note.clone();
        let sd_root = self.sd_root.clone();
        let sd = self.sd.clone();
        let log_writer = self.log_writer.clone();
        let activity = self.activity.clone();
        let instance_id = self.instance_id.clone();
        let content = content.to_string();

        self.run_serialized(&note.clone(), move || -> Result<u64> {
            let update = doc.apply_local(&content);
            if update.is_empty() {
                return Ok(doc.vector_clock().sequence_for(&instance_id));
            }
            let receipt = log_writer.write_update(&sd_root, &sd, &note, &update)?;
            doc.record_local_write(&instance_id, receipt.sequence, receipt.offset, &receipt.filename);
            activity.append(&sd_root, &note, receipt.sequence)?;
            Ok(receipt.sequence)
        })
    }

    /// Read the current encoded body text for `note`, loading if needed.
    pub fn read_body(&self, note: &NoteId) -> Result<String> {
        Ok(self.get_or_load(note)?.get_body())
    }

    /// Rescan `note`'s logs for records not yet reflected in its cached
    /// document, without discarding cached state (§4.9). If `note` isn't
    /// currently cached this is equivalent to [`Self::get_or_load`].
    /// Enqueued on the note's FIFO so it can't race a concurrent local or
    /// remote write.
    pub fn catch_up(&self, note: &NoteId) -> Result<Vec<crate::storage::TruncatedTail>> {
        let doc = self.get_or_load(note)?;
        let note = note.clone();
        let sd_root = self.sd_root.clone();
        let loader = self.loader.clone();
        self.run_serialized(&note.clone(), move || loader.catch_up(&sd_root, &note, &doc))
    }

    /// Access to this manager's filesystem and clock, for collaborators
    /// (e.g. the watcher and reload pipeline) constructed alongside it.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// This manager's clock handle.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// This process's own instance id, for callers that need to
    /// distinguish self-originated activity from a peer's (§4.8).
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The storage directory root this manager serves.
    pub fn sd_root(&self) -> &std::path::Path {
        &self.sd_root
    }
}
