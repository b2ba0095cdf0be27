//! Unified error type for the NoteCove sync engine.
//!
//! These variants mirror the behavioral error kinds in the design: most are
//! not fatal to the system as a whole, only to the operation that raised
//! them, and several (`Truncated`, `SequenceViolation`, `ActivityGap`) are
//! routine signals consumed by the reload pipeline rather than surfaced to
//! callers.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for NoteCove storage and sync operations.
#[derive(Debug, Error)]
pub enum NoteCoveError {
    /// General I/O failure not otherwise categorized below.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to read a specific file.
    #[error("failed to read '{path}': {source}")]
    FileRead {
        /// Path that failed to be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to write a specific file.
    #[error("failed to write '{path}': {source}")]
    FileWrite {
        /// Path that failed to be written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A parser ran past the end of the buffer while decoding a record.
    ///
    /// Not corruption: the writer is mid-append or the bytes are still
    /// syncing in from another device. Callers retry later (§4.10).
    #[error("truncated record in '{path}' at offset {at_offset}")]
    Truncated {
        /// File being parsed.
        path: PathBuf,
        /// Byte offset at which the incomplete record begins.
        at_offset: u64,
    },

    /// A log or snapshot file's magic bytes didn't match the expected value.
    #[error("magic mismatch in '{path}': expected {expected:?}, got {got:?}")]
    MagicMismatch {
        /// File being parsed.
        path: PathBuf,
        /// Magic bytes this format requires.
        expected: [u8; 4],
        /// Magic bytes actually present.
        got: [u8; 4],
    },

    /// A log or snapshot file declared a format version this build can't read.
    #[error("unknown format version {version} in '{path}'")]
    UnknownVersion {
        /// File being parsed.
        path: PathBuf,
        /// Version byte found in the file.
        version: u8,
    },

    /// `apply_remote` was given a sequence that isn't `clock[origin] + 1`.
    ///
    /// Recoverable: the caller escalates to the reload pipeline rather than
    /// treating this as a permanent failure.
    #[error("sequence violation: expected {expected}, got {got}")]
    SequenceViolation {
        /// Sequence number the document's clock expected next.
        expected: u64,
        /// Sequence number actually supplied.
        got: u64,
    },

    /// The loader found a non-contiguous sequence range in this instance's
    /// own logs. Fatal for the note: it enters a read-only state.
    #[error("gap in own log for instance '{instance_id}': missing sequence {missing}")]
    SequenceGapInOwnLog {
        /// Instance whose log has the gap.
        instance_id: String,
        /// First missing sequence number.
        missing: u64,
    },

    /// An activity-log reader saw a minimum sequence greater than
    /// `watermark + 1`, indicating lines were compacted out from under it.
    #[error("activity gap for instance '{instance_id}': watermark {watermark}, min seen {min_seen}")]
    ActivityGap {
        /// Instance whose activity file has the gap.
        instance_id: String,
        /// Reader's watermark before the gap was detected.
        watermark: u64,
        /// Minimum sequence observed in the file.
        min_seen: u64,
    },

    /// A reload attempt exhausted its 60s retry budget without finding the
    /// referenced bytes. Published to the stale-sync list, not retried.
    #[error("stale sync for note '{note_id}' from '{origin}': expected sequence {expected}")]
    StaleSync {
        /// Note that failed to converge.
        note_id: String,
        /// Instance whose update never arrived.
        origin: String,
        /// Sequence number that was being waited for.
        expected: u64,
    },

    /// A CRDT (yrs) encode/decode/apply operation failed.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// Config file failed to parse.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config failed to serialize.
    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Could not determine a default configuration directory.
    #[error("could not determine config directory")]
    NoConfigDir,

    /// The storage directory at the given path is not registered.
    #[error("storage directory not registered: '{0}'")]
    SdNotRegistered(PathBuf),

    /// The storage directory declares a schema version newer than this
    /// build understands.
    #[error("storage directory '{path}' uses schema version {found}, this build supports up to {supported}")]
    UnsupportedSdVersion {
        /// Path to the storage directory.
        path: PathBuf,
        /// Version declared by the directory.
        found: u32,
        /// Highest version this build supports.
        supported: u32,
    },
}

/// Result type alias for NoteCove operations.
pub type Result<T> = std::result::Result<T, NoteCoveError>;

/// A serializable representation of [`NoteCoveError`], for passing error
/// detail across an IPC boundary to a renderer or CLI frontend.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name.
    pub kind: String,
    /// Human-readable error message.
    pub message: String,
    /// Associated path, if applicable.
    pub path: Option<PathBuf>,
}

impl From<&NoteCoveError> for SerializableError {
    fn from(err: &NoteCoveError) -> Self {
        let kind = match err {
            NoteCoveError::Io(_) => "Io",
            NoteCoveError::FileRead { .. } => "FileRead",
            NoteCoveError::FileWrite { .. } => "FileWrite",
            NoteCoveError::Truncated { .. } => "Truncated",
            NoteCoveError::MagicMismatch { .. } => "MagicMismatch",
            NoteCoveError::UnknownVersion { .. } => "UnknownVersion",
            NoteCoveError::SequenceViolation { .. } => "SequenceViolation",
            NoteCoveError::SequenceGapInOwnLog { .. } => "SequenceGapInOwnLog",
            NoteCoveError::ActivityGap { .. } => "ActivityGap",
            NoteCoveError::StaleSync { .. } => "StaleSync",
            NoteCoveError::Crdt(_) => "Crdt",
            NoteCoveError::ConfigParse(_) => "ConfigParse",
            NoteCoveError::ConfigSerialize(_) => "ConfigSerialize",
            NoteCoveError::NoConfigDir => "NoConfigDir",
            NoteCoveError::SdNotRegistered(_) => "SdNotRegistered",
            NoteCoveError::UnsupportedSdVersion { .. } => "UnsupportedSdVersion",
        }
        .to_string();

        let path = match err {
            NoteCoveError::FileRead { path, .. } => Some(path.clone()),
            NoteCoveError::FileWrite { path, .. } => Some(path.clone()),
            NoteCoveError::Truncated { path, .. } => Some(path.clone()),
            NoteCoveError::MagicMismatch { path, .. } => Some(path.clone()),
            NoteCoveError::UnknownVersion { path, .. } => Some(path.clone()),
            NoteCoveError::SdNotRegistered(path) => Some(path.clone()),
            NoteCoveError::UnsupportedSdVersion { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<NoteCoveError> for SerializableError {
    fn from(err: NoteCoveError) -> Self {
        SerializableError::from(&err)
    }
}

impl NoteCoveError {
    /// Convert to a serializable representation for IPC.
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// True for errors the reload pipeline treats as routine retry signals
    /// rather than surfacing to the local-write caller (§7).
    pub fn is_routine_sync_signal(&self) -> bool {
        matches!(
            self,
            NoteCoveError::Truncated { .. } | NoteCoveError::SequenceViolation { .. }
        )
    }
}
