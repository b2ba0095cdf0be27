//! Filesystem abstraction.
//!
//! Every on-disk operation the engine performs — log append, snapshot
//! write, activity-log compaction, directory listing — goes through this
//! trait instead of calling `std::fs` directly, so storage, activity, and
//! reload logic can be exercised against an in-memory filesystem in tests
//! (§9 "construction takes the filesystem and clock abstractions").
//!
//! This is deliberately synchronous: the engine is not tied to any async
//! runtime (§5), and per-note work is already serialized onto blocking
//! tasks by the note manager's FIFO queues.

mod memory;
mod native;

pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;

use std::io::Result;
use std::path::{Path, PathBuf};

/// A directory entry returned by [`FileSystem::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Full path of the entry.
    pub path: PathBuf,
    /// True if the entry is itself a directory.
    pub is_dir: bool,
}

/// Abstraction over the filesystem operations the engine needs.
///
/// `Send + Sync` so an `Arc<dyn FileSystem>` can be shared across the
/// per-note worker tasks.
pub trait FileSystem: Send + Sync {
    /// Read an entire file into memory.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create a file with the given content, failing if it already exists.
    /// Used for SD_ID and other files that must never be silently clobbered.
    fn write_new(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Durably overwrite a file: write to a temp path in the same
    /// directory, then rename into place. Used for status flips and index
    /// files where a crash must never leave a half-written file visible
    /// under the real name.
    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Append bytes to a file, creating it if absent. Returns the file's
    /// length before the append (the offset the new bytes start at).
    fn append(&self, path: &Path, content: &[u8]) -> Result<u64>;

    /// Current length of a file in bytes.
    fn file_len(&self, path: &Path) -> Result<u64>;

    /// Non-recursive directory listing.
    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Whether a path exists (file or directory).
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove a single file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Rename/move a path, overwriting the destination if present (used by
    /// activity-log compaction's atomic swap).
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Last-modified time in milliseconds since the Unix epoch, if known.
    fn modified_ms(&self, path: &Path) -> Option<i64>;
}

impl<T: FileSystem + ?Sized> FileSystem for &T {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        (**self).read(path)
    }

    fn write_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        (**self).write_new(path, content)
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        (**self).write_atomic(path, content)
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<u64> {
        (**self).append(path, content)
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        (**self).file_len(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        (**self).list_dir(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        (**self).create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        (**self).remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        (**self).rename(from, to)
    }

    fn modified_ms(&self, path: &Path) -> Option<i64> {
        (**self).modified_ms(path)
    }
}
