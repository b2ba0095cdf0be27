//! Engine tunables (ambient configuration backing every timed or
//! size-bounded component below).
//!
//! Grounded on `diaryx_core::config::Config`: serde + TOML, a
//! `Default` impl with sensible values, and `load`/`save` against the
//! native config directory, generalized from Diaryx's workspace/editor
//! settings to NoteCove's storage/sync tunables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NoteCoveError, Result};
use crate::fs::FileSystem;

/// Tunable parameters for the storage and sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Log file rotates once appending a record would exceed this size,
    /// in bytes (§4.2).
    pub log_max_size: u64,

    /// Write a new snapshot once this many log records have accumulated
    /// since the last one (§4.3).
    pub snapshot_threshold: u64,

    /// Minimum time between automatic snapshots, in milliseconds (§4.3).
    pub snapshot_min_interval_ms: i64,

    /// Activity log rotates/compacts once it exceeds this size, in bytes
    /// (§4.6).
    pub activity_max_size: u64,

    /// Number of most recent activity lines kept per compaction (§4.6).
    pub activity_keep: usize,

    /// Poll-backstop interval for filesystems that don't deliver reliable
    /// watch events, in milliseconds (§4.8).
    pub poll_interval_ms: u64,

    /// How often this instance refreshes its profile presence heartbeat,
    /// in milliseconds (§3 "Profile presence").
    pub presence_interval_ms: u64,

    /// Debounce window for coalescing filesystem watch events, in
    /// milliseconds (§4.8).
    pub debounce_window_ms: u64,

    /// Initial delay before the first reload retry, in milliseconds
    /// (§4.10).
    pub reload_backoff_initial_ms: u64,

    /// Cap on the reload retry delay, in milliseconds (§4.10).
    pub reload_backoff_max_ms: u64,

    /// Total time budget a reload gets before it is published to the
    /// stale-sync list, in milliseconds (§4.10).
    pub reload_budget_ms: u64,

    /// Maximum number of documents kept warm in the note manager's cache
    /// (§4.7).
    pub note_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_max_size: 1024 * 1024,
            snapshot_threshold: 200,
            snapshot_min_interval_ms: 60_000,
            activity_max_size: 64 * 1024,
            activity_keep: 2000,
            poll_interval_ms: 3_000,
            presence_interval_ms: 60_000,
            debounce_window_ms: 100,
            reload_backoff_initial_ms: 250,
            reload_backoff_max_ms: 30_000,
            reload_budget_ms: 60_000,
            note_cache_size: 64,
        }
    }
}

impl EngineConfig {
    /// The reload backoff delay as a [`Duration`].
    pub fn reload_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.reload_backoff_initial_ms)
    }

    /// The reload backoff cap as a [`Duration`].
    pub fn reload_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reload_backoff_max_ms)
    }

    /// The reload retry budget as a [`Duration`].
    pub fn reload_budget(&self) -> Duration {
        Duration::from_millis(self.reload_budget_ms)
    }

    /// Load config from a specific path via a [`FileSystem`], returning
    /// defaults if the file doesn't exist.
    pub fn load_from(fs: &dyn FileSystem, path: &std::path::Path) -> Result<Self> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        let bytes = fs.read(path).map_err(|e| NoteCoveError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let contents = String::from_utf8_lossy(&bytes);
        let config: EngineConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a specific path via a [`FileSystem`].
    pub fn save_to(&self, fs: &dyn FileSystem, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent).map_err(NoteCoveError::Io)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs.write_atomic(path, contents.as_bytes())
            .map_err(|e| NoteCoveError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Default config file path (`~/.config/notecove/config.toml`),
    /// native platforms only.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("notecove").join("config.toml"))
    }

    /// Load config from the default location, falling back to defaults
    /// if the directory can't be determined or the file is absent.
    pub fn load(fs: &dyn FileSystem) -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(fs, &path),
            None => Ok(Self::default()),
        }
    }

    /// Save config to the default location.
    pub fn save(&self, fs: &dyn FileSystem) -> Result<()> {
        let path = Self::default_path().ok_or(NoteCoveError::NoConfigDir)?;
        self.save_to(fs, &path)
    }
}
