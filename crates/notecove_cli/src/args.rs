//! Command-line argument structures and enums.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "notecove")]
#[command(version)]
#[command(about = "Drive the NoteCove CRDT notes-sync engine from a terminal", long_about = None)]
pub struct Cli {
    /// Storage directory to operate on. Remembered after `register` so
    /// later commands can omit it.
    #[arg(long, global = true)]
    pub sd: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a storage directory and remember it as the active one.
    Register {
        /// Path to the storage directory root.
        sd_path: PathBuf,
    },

    /// Replace a note's body with `text`.
    Edit {
        /// Note id to edit.
        note: String,

        /// New body text.
        text: String,
    },

    /// Print a note's current body.
    Show {
        /// Note id to show.
        note: String,
    },

    /// Force an immediate snapshot write for a note.
    Snapshot {
        /// Note id to snapshot.
        note: String,
    },

    /// Force a rescan of a note's logs without waiting for the watcher.
    Reload {
        /// Note id to reload.
        note: String,
    },

    /// List notes whose incoming sync never converged within budget.
    StaleSyncs,
}
