//! Real filesystem implementation, backed directly by `std::fs`.

use std::fs::{self, OpenOptions};
use std::io::{Error, ErrorKind, Result, Write};
use std::path::Path;

use super::{DirEntry, FileSystem};

/// Maps `FileSystem` operations directly onto `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(content)
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "path has no parent directory")
        })?;
        let tmp = parent.join(format!(
            ".{}.tmp",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("notecove")
        ));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<u64> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        let offset = file.metadata()?.len();
        file.write_all(content)?;
        file.sync_data()?;
        Ok(offset)
    }

    fn file_len(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        if !dir.is_dir() {
            return Ok(entries);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_dir = entry.file_type()?.is_dir();
            entries.push(DirEntry { path, is_dir });
        }
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)
    }

    fn modified_ms(&self, path: &Path) -> Option<i64> {
        fs::metadata(path)
            .ok()?
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as i64)
    }
}
