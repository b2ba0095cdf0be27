//! Per-note CRDT storage and cross-instance filesystem sync engine.
//!
//! Notes live as `yrs` CRDT documents, persisted as append-only per-
//! instance logs plus periodic snapshots under a storage directory (an
//! "SD"), and kept in sync across instances purely by watching the
//! filesystem — no network transport, no central server.
#![warn(missing_docs)]

/// Identifiers used throughout the engine (instances, profiles, SDs, notes).
pub mod ids;

/// Unified error type for storage and sync operations.
pub mod error;

/// Monotonic wall-clock abstraction for deterministic testing.
pub mod clock;

/// Filesystem abstraction every on-disk operation goes through.
pub mod fs;

/// Engine tunables: log/snapshot sizing, backoff, polling, presence.
pub mod config;

/// Binary encode/decode for log records, snapshots, and vector clocks.
pub mod codec;

/// The per-note CRDT document and its durable vector clock.
pub mod crdt;

/// On-disk storage for per-note CRDT logs and snapshots.
pub mod storage;

/// Per-instance activity log and gap-aware readers.
pub mod activity;

/// Per-SD note cache and per-note serialization.
pub mod note_manager;

/// Filesystem watcher and event normalization.
pub mod watcher;

/// Reload pipeline: backoff, supersession, and stale-sync tracking.
pub mod reload;

/// Storage directory identity and profile presence.
pub mod sd;

/// Metadata index trait — owned by an external collaborator.
pub mod metadata_index;

/// The public engine handle tying every component together.
pub mod engine;

pub use engine::{Engine, ProfileInfo};
pub use error::{NoteCoveError, Result};
pub use ids::{InstanceId, NoteId, ProfileId, SdId};
