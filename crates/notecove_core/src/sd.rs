//! Storage directory identity and profile presence (§3 "Instance
//! identity", §4.10 "SD/instance identity").
//!
//! Grounded on `diaryx_core::workspace`'s pattern of a workspace-
//! identifying marker file read/created idempotently on registration,
//! generalized to a UUID `SD_ID` plus a hard version gate: unlike
//! `diaryx_core::config`'s tolerant-load-with-defaults posture, an SD
//! declaring a schema version newer than this build supports is refused
//! outright — this format has no forward-compatibility story (§4.10).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{NoteCoveError, Result};
use crate::fs::FileSystem;
use crate::ids::ProfileId;

/// Schema version this build writes and the highest it accepts.
pub const CURRENT_SD_VERSION: u32 = 1;

const SD_ID_FILE: &str = "SD_ID";
const SD_VERSION_FILE: &str = "SD_VERSION";

/// Identity of a registered storage directory: its pinned UUID and its
/// declared schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdIdentity {
    /// UUID stored in `SD_ID`, pinned to this path for its lifetime.
    pub id: String,
    /// Schema version stored in `SD_VERSION`.
    pub version: u32,
}

/// Read an existing `SD_ID`/`SD_VERSION` pair from `sd_root`, or create
/// both if absent.
///
/// Concurrent creation from two instances is resolved without an
/// unbounded detection window (§9 Open Question): this uses
/// [`FileSystem::write_new`] (create-new-exclusive) to write `SD_ID`; if
/// that fails because the file now exists, the loser simply reads back
/// whatever the winner wrote. One retry is enough because the outcome of
/// `write_new` already tells us which case we're in — there is nothing
/// to retry for.
pub fn register(fs: &dyn FileSystem, sd_root: &Path) -> Result<SdIdentity> {
    fs.create_dir_all(sd_root).map_err(NoteCoveError::Io)?;

    let id_path = sd_root.join(SD_ID_FILE);
    let id = match fs.write_new(&id_path, Uuid::new_v4().to_string().as_bytes()) {
        Ok(()) => {
            log::debug!("sd::register: created new SD_ID at {:?}", id_path);
            read_id(fs, &id_path)?
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            log::debug!("sd::register: adopting existing SD_ID at {:?}", id_path);
            read_id(fs, &id_path)?
        }
        Err(e) => return Err(NoteCoveError::FileWrite { path: id_path, source: e }),
    };

    let version_path = sd_root.join(SD_VERSION_FILE);
    let version = match fs.write_new(&version_path, CURRENT_SD_VERSION.to_string().as_bytes()) {
        Ok(()) => CURRENT_SD_VERSION,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => read_version(fs, &version_path)?,
        Err(e) => {
            return Err(NoteCoveError::FileWrite {
                path: version_path,
                source: e,
            });
        }
    };

    if version > CURRENT_SD_VERSION {
        return Err(NoteCoveError::UnsupportedSdVersion {
            path: sd_root.to_path_buf(),
            found: version,
            supported: CURRENT_SD_VERSION,
        });
    }

    Ok(SdIdentity { id, version })
}

fn read_id(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let bytes = fs.read(path).map_err(|e| NoteCoveError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

fn read_version(fs: &dyn FileSystem, path: &Path) -> Result<u32> {
    let bytes = fs.read(path).map_err(|e| NoteCoveError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    String::from_utf8_lossy(&bytes)
        .trim()
        .parse()
        .map_err(|_| NoteCoveError::UnsupportedSdVersion {
            path: path.to_path_buf(),
            found: 0,
            supported: CURRENT_SD_VERSION,
        })
}

/// `<sd>/profiles/<profileId>.json` contents (§3 "Profile presence").
/// Informational only — never consulted for sync correctness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePresence {
    /// The profile this presence file belongs to.
    pub profile_id: String,
    /// Human-readable display name for the profile.
    pub profile_name: String,
    /// Local OS username.
    pub username: String,
    /// User-chosen handle, if set.
    pub handle: Option<String>,
    /// Hostname of the machine running this instance.
    pub hostname: String,
    /// Platform identifier (e.g. "linux", "macos", "windows").
    pub platform: String,
    /// Milliseconds since the Unix epoch this file was last written.
    pub last_seen: i64,
}

fn profile_path(sd_root: &Path, profile_id: &ProfileId) -> PathBuf {
    sd_root.join("profiles").join(format!("{}.json", profile_id.as_str()))
}

/// Writes this instance's profile presence heartbeat every
/// `presence_interval_ms` (driven externally by the engine's scheduler;
/// this type only knows how to perform one heartbeat write, not how to
/// schedule it, keeping it testable without a timer).
pub struct PresenceWriter {
    fs: std::sync::Arc<dyn FileSystem>,
    clock: std::sync::Arc<dyn Clock>,
    profile_id: ProfileId,
    profile_name: String,
    username: String,
    handle: Option<String>,
    hostname: String,
    platform: String,
}

impl PresenceWriter {
    /// Build a presence writer for one profile/instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: std::sync::Arc<dyn FileSystem>,
        clock: std::sync::Arc<dyn Clock>,
        profile_id: ProfileId,
        profile_name: String,
        username: String,
        handle: Option<String>,
        hostname: String,
        platform: String,
    ) -> Self {
        Self {
            fs,
            clock,
            profile_id,
            profile_name,
            username,
            handle,
            hostname,
            platform,
        }
    }

    /// Write (or overwrite) this profile's presence file with the
    /// current timestamp.
    pub fn heartbeat(&self, sd_root: &Path) -> Result<()> {
        let path = profile_path(sd_root, &self.profile_id);
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).map_err(NoteCoveError::Io)?;
        }
        let presence = ProfilePresence {
            profile_id: self.profile_id.as_str().to_string(),
            profile_name: self.profile_name.clone(),
            username: self.username.clone(),
            handle: self.handle.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            last_seen: self.clock.now_ms(),
        };
        let json = serde_json::to_vec_pretty(&presence).map_err(|e| NoteCoveError::Crdt(e.to_string()))?;
        self.fs
            .write_atomic(&path, &json)
            .map_err(|e| NoteCoveError::FileWrite { path, source: e })
    }
}

/// Read another instance's presence file, if present.
pub fn read_presence(fs: &dyn FileSystem, sd_root: &Path, profile_id: &ProfileId) -> Result<Option<ProfilePresence>> {
    let path = profile_path(sd_root, profile_id);
    if !fs.exists(&path) {
        return Ok(None);
    }
    let bytes = fs.read(&path).map_err(|e| NoteCoveError::FileRead {
        path: path.clone(),
        source: e,
    })?;
    let presence: ProfilePresence =
        serde_json::from_slice(&bytes).map_err(|e| NoteCoveError::Crdt(format!("parse presence '{path:?}': {e}")))?;
    Ok(Some(presence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::fs::InMemoryFileSystem;
    use std::sync::Arc;

    #[test]
    fn register_creates_id_and_version_on_first_call() {
        let fs = InMemoryFileSystem::new();
        let root = Path::new("/sd");
        let identity = register(&fs, root).unwrap();
        assert_eq!(identity.version, CURRENT_SD_VERSION);
        assert!(Uuid::parse_str(&identity.id).is_ok());
    }

    #[test]
    fn register_is_idempotent_across_calls() {
        let fs = InMemoryFileSystem::new();
        let root = Path::new("/sd");
        let first = register(&fs, root).unwrap();
        let second = register(&fs, root).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn register_refuses_newer_version() {
        let fs = InMemoryFileSystem::new();
        let root = Path::new("/sd");
        fs.create_dir_all(root).unwrap();
        fs.write_new(&root.join(SD_ID_FILE), b"11111111-1111-1111-1111-111111111111")
            .unwrap();
        fs.write_new(&root.join(SD_VERSION_FILE), b"99").unwrap();

        let err = register(&fs, root).unwrap_err();
        assert!(matches!(err, NoteCoveError::UnsupportedSdVersion { found: 99, .. }));
    }

    #[test]
    fn presence_heartbeat_then_read_round_trips() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let clock = Arc::new(FakeClock::new(5_000));
        let profile = ProfileId::new("alice");
        let writer = PresenceWriter::new(
            fs.clone(),
            clock.clone(),
            profile.clone(),
            "Alice".to_string(),
            "alice".to_string(),
            Some("@alice".to_string()),
            "alice-laptop".to_string(),
            "macos".to_string(),
        );

        let root = Path::new("/sd");
        writer.heartbeat(root).unwrap();

        let presence = read_presence(fs.as_ref(), root, &profile).unwrap().unwrap();
        assert_eq!(presence.last_seen, 5_000);
        assert_eq!(presence.hostname, "alice-laptop");
    }

    #[test]
    fn read_presence_returns_none_when_absent() {
        let fs = InMemoryFileSystem::new();
        let profile = ProfileId::new("bob");
        assert!(read_presence(&fs, Path::new("/sd"), &profile).unwrap().is_none());
    }
}
