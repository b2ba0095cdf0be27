//! Identifiers used throughout the engine (§3 "Instance identity").
//!
//! These are thin newtypes over `String` rather than raw strings so that
//! the signatures in `storage`, `crdt`, and `reload` can't confuse an
//! `InstanceId` for a `NoteId` at the type level.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw string as this id type.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    InstanceId,
    "A stable short identifier for one device+install."
);
string_id!(ProfileId, "Groups instances that represent the same user.");
string_id!(SdId, "UUID identifying a Storage Directory, pinned to its path.");

/// Opaque, stable identifier for a note. Must not contain path separators
/// (§6 "Filenames are ASCII").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteId(String);

impl NoteId {
    /// Wrap a raw string as a note id, rejecting path separators.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.contains('/') || raw.contains('\\') {
            return None;
        }
        Some(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate that an `instanceId` or `profileId` component of a filename is
/// a non-empty, URL-safe, path-separator-free string of at most 64 bytes
/// (§6 "Filenames are authoritative"). A 1-byte id is explicitly accepted
/// (§8 "1-byte instanceId").
pub fn is_valid_filename_component(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Join a storage directory root with its `notes/<id>` subtree, used
/// throughout `storage` and `activity` to keep path construction in one
/// place.
pub fn note_dir(sd_root: &Path, note: &NoteId) -> std::path::PathBuf {
    sd_root.join("notes").join(note.as_str())
}
