//! In-memory filesystem for deterministic tests of storage, activity, and
//! reload logic without touching disk.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DirEntry, FileSystem};

#[derive(Debug, Clone)]
struct Entry {
    content: Vec<u8>,
    modified_ms: i64,
}

/// An in-memory [`FileSystem`], grounded on the same directory-tree shape
/// as [`super::RealFileSystem`] but backed by a `HashMap<PathBuf, Entry>`.
/// Directories are implicit: any path that is a strict prefix of a file's
/// path "exists" and "is a directory".
#[derive(Default)]
pub struct InMemoryFileSystem {
    files: Mutex<HashMap<PathBuf, Entry>>,
    clock_ms: Mutex<i64>,
}

impl InMemoryFileSystem {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms(&self) -> i64 {
        let mut c = self.clock_ms.lock().unwrap();
        *c += 1;
        *c
    }

    fn is_dir_path(&self, path: &Path, files: &HashMap<PathBuf, Entry>) -> bool {
        files.keys().any(|p| p.starts_with(path) && p != path)
    }
}

fn not_found(path: &Path) -> Error {
    Error::new(ErrorKind::NotFound, format!("not found: {}", path.display()))
}

impl FileSystem for InMemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.lock().unwrap();
        files
            .get(path)
            .map(|e| e.content.clone())
            .ok_or_else(|| not_found(path))
    }

    fn write_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        let now = self.now_ms();
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("already exists: {}", path.display()),
            ));
        }
        files.insert(
            path.to_path_buf(),
            Entry {
                content: content.to_vec(),
                modified_ms: now,
            },
        );
        Ok(())
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let now = self.now_ms();
        let mut files = self.files.lock().unwrap();
        files.insert(
            path.to_path_buf(),
            Entry {
                content: content.to_vec(),
                modified_ms: now,
            },
        );
        Ok(())
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<u64> {
        let now = self.now_ms();
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(path.to_path_buf()).or_insert(Entry {
            content: Vec::new(),
            modified_ms: now,
        });
        let offset = entry.content.len() as u64;
        entry.content.extend_from_slice(content);
        entry.modified_ms = now;
        Ok(offset)
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        let files = self.files.lock().unwrap();
        files
            .get(path)
            .map(|e| e.content.len() as u64)
            .ok_or_else(|| not_found(path))
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let files = self.files.lock().unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for path in files.keys() {
            if let Ok(rest) = path.strip_prefix(dir) {
                if let Some(first) = rest.components().next() {
                    let child = dir.join(first.as_os_str());
                    seen.insert(child);
                }
            }
        }
        Ok(seen
            .into_iter()
            .map(|path| {
                let is_dir = self.is_dir_path(&path, &files);
                DirEntry { path, is_dir }
            })
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.lock().unwrap();
        files.contains_key(path) || self.is_dir_path(path, &files)
    }

    fn create_dir_all(&self, _path: &Path) -> Result<()> {
        // Directories are implicit; nothing to materialize.
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_path_buf(), entry);
        Ok(())
    }

    fn modified_ms(&self, path: &Path) -> Option<i64> {
        let files = self.files.lock().unwrap();
        files.get(path).map(|e| e.modified_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let fs = InMemoryFileSystem::new();
        let path = Path::new("/sd/notes/a/log.crdtlog");
        fs.append(path, b"hello").unwrap();
        fs.append(path, b" world").unwrap();
        assert_eq!(fs.read(path).unwrap(), b"hello world");
    }

    #[test]
    fn write_new_rejects_duplicate() {
        let fs = InMemoryFileSystem::new();
        let path = Path::new("/sd/SD_ID");
        fs.write_new(path, b"id").unwrap();
        assert!(fs.write_new(path, b"id2").is_err());
    }

    #[test]
    fn list_dir_surfaces_immediate_children() {
        let fs = InMemoryFileSystem::new();
        fs.write_atomic(Path::new("/sd/notes/a/log.crdtlog"), b"x")
            .unwrap();
        fs.write_atomic(Path::new("/sd/notes/b/log.crdtlog"), b"y")
            .unwrap();
        let entries = fs.list_dir(Path::new("/sd/notes")).unwrap();
        let mut names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(entries.iter().all(|e| e.is_dir));
    }

    #[test]
    fn rename_moves_entry() {
        let fs = InMemoryFileSystem::new();
        let from = Path::new("/sd/notes/a/snap.incomplete");
        let to = Path::new("/sd/notes/a/snap.snapshot");
        fs.write_atomic(from, b"data").unwrap();
        fs.rename(from, to).unwrap();
        assert!(!fs.exists(from));
        assert_eq!(fs.read(to).unwrap(), b"data");
    }
}
