//! Reload pipeline (§4.9 "Reload pipeline", §4.11 "State machine").
//!
//! Modeled as an explicit `Pending → Scanning → Waiting → Applied | Stale`
//! state machine per §9 "Suspend/cancel" — not a free-floating async
//! chain, so supersession, timeout, and cancellation are observable and
//! testable without a runtime. Supersession (a higher `target_seq`
//! arriving for the same `(note, origin)`) is a generation counter
//! bumped on every `request`; any in-flight attempt whose generation has
//! fallen behind is simply ignored when it reports back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::ids::{InstanceId, NoteId};

/// Exponential backoff schedule from §4.9: 250ms, 500ms, 1s, 2s, 4s, 8s,
/// 16s, capped at `max_ms` (default 30s).
pub fn backoff_delay_ms(attempt: u32, initial_ms: u64, max_ms: u64) -> u64 {
    let shift = attempt.min(24);
    initial_ms.saturating_mul(1u64 << shift).min(max_ms)
}

/// Where a `(note, origin)` reload request currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadState {
    /// Queued, not yet dequeued for scanning.
    Pending,
    /// Actively scanning `logs/` for the referenced record.
    Scanning,
    /// Record not found or truncated; waiting for the next backoff tick.
    Waiting {
        /// Number of scan attempts made so far.
        attempt: u32,
        /// When (per the pipeline's [`Clock`]) the next attempt is due.
        retry_at_ms: i64,
    },
    /// The record was found and applied.
    Applied,
    /// The 60s budget was exhausted without finding the record.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReloadKey {
    note: NoteId,
    origin: InstanceId,
}

#[derive(Debug, Clone)]
struct ReloadTask {
    target_seq: u64,
    generation: u64,
    state: ReloadState,
    started_at_ms: i64,
}

/// A reload that exhausted its retry budget, published for the user to
/// act on (§6 "get_stale_syncs").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSync {
    /// Note that failed to converge.
    pub note_id: NoteId,
    /// Instance whose update never arrived.
    pub origin: InstanceId,
    /// Sequence number that was being waited for.
    pub expected: u64,
    /// Highest sequence from `origin` actually observed, if any.
    pub highest: u64,
}

/// Manages in-flight reload attempts for every `(note, origin)` pair
/// across all SDs this process has registered.
pub struct ReloadPipeline {
    clock: Arc<dyn Clock>,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    budget_ms: u64,
    tasks: Mutex<HashMap<ReloadKey, ReloadTask>>,
    stale: Mutex<Vec<StaleSync>>,
}

impl ReloadPipeline {
    /// Build a pipeline using `clock` for all timing decisions, with the
    /// given backoff/budget tunables (§ "AMBIENT STACK" config).
    pub fn new(clock: Arc<dyn Clock>, backoff_initial_ms: u64, backoff_max_ms: u64, budget_ms: u64) -> Self {
        Self {
            clock,
            backoff_initial_ms,
            backoff_max_ms,
            budget_ms,
            tasks: Mutex::new(HashMap::new()),
            stale: Mutex::new(Vec::new()),
        }
    }

    /// Request that `note` be brought up to `target_seq` from `origin`.
    /// Returns the generation this request was assigned; a caller
    /// currently scanning for an older generation should abandon that
    /// attempt once it learns a newer one exists.
    pub fn request(&self, note: &NoteId, origin: &InstanceId, target_seq: u64) -> u64 {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        let now = self.clock.now_ms();
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&key) {
            Some(task) if task.state == ReloadState::Applied && task.target_seq >= target_seq => task.generation,
            Some(task) if target_seq > task.target_seq => {
                task.target_seq = target_seq;
                task.generation += 1;
                task.state = ReloadState::Pending;
                task.started_at_ms = now;
                task.generation
            }
            Some(task) => task.generation,
            None => {
                tasks.insert(
                    key,
                    ReloadTask {
                        target_seq,
                        generation: 0,
                        state: ReloadState::Pending,
                        started_at_ms: now,
                    },
                );
                0
            }
        }
    }

    /// Dequeue `(note, origin)` for scanning, returning the target
    /// sequence and generation to scan for, if it's still pending.
    pub fn begin_scan(&self, note: &NoteId, origin: &InstanceId) -> Option<(u64, u64)> {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&key)?;
        if task.state != ReloadState::Pending {
            return None;
        }
        task.state = ReloadState::Scanning;
        Some((task.target_seq, task.generation))
    }

    /// Report that a scan for `generation` found and applied the record.
    /// Ignored if a newer generation has since superseded this attempt.
    pub fn record_found(&self, note: &NoteId, origin: &InstanceId, generation: u64) {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&key) {
            if task.generation == generation {
                task.state = ReloadState::Applied;
            }
        }
    }

    /// Report that a scan for `generation` did not find the record
    /// (missing or truncated). Schedules the next backoff attempt, or
    /// publishes a [`StaleSync`] if the 60s budget is exhausted.
    pub fn record_not_found(&self, note: &NoteId, origin: &InstanceId, generation: u64, highest_seen: u64) {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        let now = self.clock.now_ms();
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&key) else {
            return;
        };
        if task.generation != generation {
            return;
        }

        let elapsed = now.saturating_sub(task.started_at_ms) as u64;
        if elapsed >= self.budget_ms {
            log::warn!(
                "ReloadPipeline: note '{}' from '{}' exhausted retry budget waiting for sequence {}, highest seen {}",
                note,
                origin,
                task.target_seq,
                highest_seen
            );
            task.state = ReloadState::Stale;
            self.stale.lock().unwrap().push(StaleSync {
                note_id: note.clone(),
                origin: origin.clone(),
                expected: task.target_seq,
                highest: highest_seen,
            });
            return;
        }

        let attempt = match task.state {
            ReloadState::Scanning => 0,
            ReloadState::Waiting { attempt, .. } => attempt + 1,
            _ => 0,
        };
        let delay = backoff_delay_ms(attempt, self.backoff_initial_ms, self.backoff_max_ms);
        task.state = ReloadState::Waiting {
            attempt,
            retry_at_ms: now + delay as i64,
        };
    }

    /// `(note, origin, generation)` triples whose backoff has elapsed
    /// and are ready to scan again.
    pub fn due_retries(&self) -> Vec<(NoteId, InstanceId, u64)> {
        let now = self.clock.now_ms();
        let mut tasks = self.tasks.lock().unwrap();
        let mut due = Vec::new();
        for (key, task) in tasks.iter_mut() {
            if let ReloadState::Waiting { retry_at_ms, .. } = task.state {
                if retry_at_ms <= now {
                    task.state = ReloadState::Scanning;
                    due.push((key.note.clone(), key.origin.clone(), task.generation));
                }
            }
        }
        due
    }

    /// Current state for `(note, origin)`, if a task has ever been
    /// requested for it.
    pub fn state_of(&self, note: &NoteId, origin: &InstanceId) -> Option<ReloadState> {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        self.tasks.lock().unwrap().get(&key).map(|t| t.state.clone())
    }

    /// The sequence number `(note, origin)` is currently being reloaded
    /// towards, if a task has ever been requested for it.
    pub fn target_seq_of(&self, note: &NoteId, origin: &InstanceId) -> Option<u64> {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        self.tasks.lock().unwrap().get(&key).map(|t| t.target_seq)
    }

    /// All currently published stale syncs (§6 `get_stale_syncs`).
    pub fn stale_syncs(&self) -> Vec<StaleSync> {
        self.stale.lock().unwrap().clone()
    }

    /// Dismiss a stale sync without retrying it.
    pub fn skip_stale(&self, note: &NoteId, origin: &InstanceId) {
        self.stale
            .lock()
            .unwrap()
            .retain(|s| !(s.note_id == *note && s.origin == *origin));
    }

    /// Move a stale sync back to `Pending` so the next watcher event (or
    /// an explicit force-reload) gets another attempt (§4.11 "Stale →
    /// Applied is allowed on any future watcher event").
    pub fn retry_stale(&self, note: &NoteId, origin: &InstanceId) {
        let key = ReloadKey {
            note: note.clone(),
            origin: origin.clone(),
        };
        let now = self.clock.now_ms();
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&key) {
            task.state = ReloadState::Pending;
            task.started_at_ms = now;
        }
        drop(tasks);
        self.stale
            .lock()
            .unwrap()
            .retain(|s| !(s.note_id == *note && s.origin == *origin));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn pipeline() -> (ReloadPipeline, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(0));
        (ReloadPipeline::new(clock.clone(), 250, 30_000, 60_000), clock)
    }

    #[test]
    fn backoff_matches_spec_schedule() {
        assert_eq!(backoff_delay_ms(0, 250, 30_000), 250);
        assert_eq!(backoff_delay_ms(1, 250, 30_000), 500);
        assert_eq!(backoff_delay_ms(2, 250, 30_000), 1_000);
        assert_eq!(backoff_delay_ms(6, 250, 30_000), 16_000);
        assert_eq!(backoff_delay_ms(7, 250, 30_000), 30_000);
        assert_eq!(backoff_delay_ms(20, 250, 30_000), 30_000);
    }

    #[test]
    fn request_then_scan_then_found_reaches_applied() {
        let (pipeline, _clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 1);
        let (target, generation) = pipeline.begin_scan(&note, &origin).unwrap();
        assert_eq!(target, 1);
        pipeline.record_found(&note, &origin, generation);
        assert_eq!(pipeline.state_of(&note, &origin), Some(ReloadState::Applied));
    }

    #[test]
    fn not_found_schedules_backoff_then_retries() {
        let (pipeline, clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 1);
        let (_, generation) = pipeline.begin_scan(&note, &origin).unwrap();
        pipeline.record_not_found(&note, &origin, generation, 0);

        assert!(pipeline.due_retries().is_empty());
        clock.advance(250);
        let due = pipeline.due_retries();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, note);
    }

    #[test]
    fn exhausted_budget_publishes_stale_sync() {
        let (pipeline, clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 5);
        clock.advance(60_000);
        let (_, generation) = pipeline.begin_scan(&note, &origin).unwrap();
        pipeline.record_not_found(&note, &origin, generation, 2);

        assert_eq!(pipeline.state_of(&note, &origin), Some(ReloadState::Stale));
        let stale = pipeline.stale_syncs();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].expected, 5);
        assert_eq!(stale[0].highest, 2);
    }

    #[test]
    fn higher_target_seq_supersedes_generation() {
        let (pipeline, _clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 1);
        let (_, gen1) = pipeline.begin_scan(&note, &origin).unwrap();
        pipeline.record_not_found(&note, &origin, gen1, 0);

        let gen2 = pipeline.request(&note, &origin, 2);
        assert_ne!(gen1, gen2);

        // The stale report for the old generation must not take effect.
        pipeline.record_not_found(&note, &origin, gen1, 0);
        assert_eq!(pipeline.state_of(&note, &origin), Some(ReloadState::Pending));
    }

    #[test]
    fn skip_stale_removes_entry_without_retrying() {
        let (pipeline, clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 1);
        clock.advance(60_000);
        let (_, generation) = pipeline.begin_scan(&note, &origin).unwrap();
        pipeline.record_not_found(&note, &origin, generation, 0);
        assert_eq!(pipeline.stale_syncs().len(), 1);

        pipeline.skip_stale(&note, &origin);
        assert!(pipeline.stale_syncs().is_empty());
    }

    #[test]
    fn retry_stale_reopens_as_pending() {
        let (pipeline, clock) = pipeline();
        let note = NoteId::new("n1").unwrap();
        let origin = InstanceId::new("a");

        pipeline.request(&note, &origin, 1);
        clock.advance(60_000);
        let (_, generation) = pipeline.begin_scan(&note, &origin).unwrap();
        pipeline.record_not_found(&note, &origin, generation, 0);

        pipeline.retry_stale(&note, &origin);
        assert_eq!(pipeline.state_of(&note, &origin), Some(ReloadState::Pending));
        assert!(pipeline.stale_syncs().is_empty());
    }
}
