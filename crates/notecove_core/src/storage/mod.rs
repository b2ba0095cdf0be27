//! On-disk storage for per-note CRDT logs and snapshots (§4.1–§4.5).

mod loader;
mod log_writer;
mod snapshot_manager;

pub use loader::{LoadedDocument, Loader, TruncatedTail};
pub use log_writer::{FilesystemLogWriter, LogWriter, WriteReceipt};
pub use snapshot_manager::SnapshotManager;
