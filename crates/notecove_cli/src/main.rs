//! Command-line interface for exercising the NoteCove sync engine.

/// Clap argument definitions.
mod args;

/// A process-local, non-persistent metadata index for CLI sessions.
mod metadata_index;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use notecove_core::clock::SystemClock;
use notecove_core::config::EngineConfig;
use notecove_core::fs::{FileSystem, RealFileSystem};
use notecove_core::ids::{InstanceId, NoteId, ProfileId, SdId};
use notecove_core::{Engine, ProfileInfo};

use args::{Cli, Commands};
use metadata_index::SessionMetadataIndex;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("✗ {err}");
            ExitCode::FAILURE
        }
    }
}

fn build_engine() -> Result<(Engine, Arc<dyn FileSystem>), String> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let clock = Arc::new(SystemClock);
    let instance_id = InstanceId::new("cli");
    let profile_id = ProfileId::new("cli");
    let config = EngineConfig::load(fs.as_ref()).map_err(|e| e.to_string())?;
    let engine = Engine::new(fs.clone(), clock, instance_id, profile_id, config).map_err(|e| e.to_string())?;
    Ok((engine, fs))
}

fn profile_info() -> ProfileInfo {
    ProfileInfo {
        profile_name: "CLI".to_string(),
        username: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        handle: None,
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        platform: std::env::consts::OS.to_string(),
    }
}

/// Where the CLI remembers the last-registered storage directory, so
/// commands after `register` can omit the path (§ "CLI... kept
/// minimal").
fn last_sd_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("notecove").join("last_sd.txt"))
}

fn remember_sd(fs: &dyn FileSystem, sd_path: &Path) -> Result<(), String> {
    let Some(path) = last_sd_path() else { return Ok(()) };
    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs.write_atomic(&path, sd_path.to_string_lossy().as_bytes())
        .map_err(|e| e.to_string())
}

fn resolve_sd_path(fs: &dyn FileSystem, explicit: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let remembered = last_sd_path().filter(|p| fs.exists(p));
    match remembered {
        Some(path) => {
            let bytes = fs.read(&path).map_err(|e| e.to_string())?;
            Ok(PathBuf::from(String::from_utf8_lossy(&bytes).into_owned()))
        }
        None => Err("no storage directory given and none registered yet; pass --sd or run `register` first".to_string()),
    }
}

fn register(engine: &Engine, sd_path: &Path) -> Result<SdId, String> {
    let index = Arc::new(SessionMetadataIndex::new());
    engine
        .register_sd(sd_path, profile_info(), index)
        .map_err(|e| e.to_string())
}

fn parse_note_id(raw: String) -> Result<NoteId, String> {
    NoteId::new(raw).ok_or_else(|| "note id must be non-empty and contain no path separators".to_string())
}

fn run(cli: Cli) -> Result<(), String> {
    let (engine, fs) = build_engine()?;

    match cli.command {
        Commands::Register { sd_path } => {
            let sd = register(&engine, &sd_path)?;
            remember_sd(fs.as_ref(), &sd_path)?;
            println!("registered {} as {}", sd_path.display(), sd.as_str());
        }

        Commands::Edit { note, text } => {
            let sd_path = resolve_sd_path(fs.as_ref(), cli.sd)?;
            let sd = register(&engine, &sd_path)?;
            let note = parse_note_id(note)?;
            let sequence = engine.apply_local_update(&sd, &note, &text).map_err(|e| e.to_string())?;
            println!("applied edit, sequence {sequence}");
        }

        Commands::Show { note } => {
            let sd_path = resolve_sd_path(fs.as_ref(), cli.sd)?;
            let sd = register(&engine, &sd_path)?;
            let note = parse_note_id(note)?;
            println!("{}", engine.read_state(&sd, &note).map_err(|e| e.to_string())?);
        }

        Commands::Snapshot { note } => {
            let sd_path = resolve_sd_path(fs.as_ref(), cli.sd)?;
            let sd = register(&engine, &sd_path)?;
            let note = parse_note_id(note)?;
            let path = engine.create_snapshot(&sd, &note).map_err(|e| e.to_string())?;
            println!("wrote snapshot {}", path.display());
        }

        Commands::Reload { note } => {
            let sd_path = resolve_sd_path(fs.as_ref(), cli.sd)?;
            let sd = register(&engine, &sd_path)?;
            let note = parse_note_id(note)?;
            engine.force_reload_from_logs(&sd, &note).map_err(|e| e.to_string())?;
            println!("reloaded {note}");
        }

        Commands::StaleSyncs => {
            let sd_path = resolve_sd_path(fs.as_ref(), cli.sd)?;
            let sd = register(&engine, &sd_path)?;
            let stale = engine.get_stale_syncs(&sd).map_err(|e| e.to_string())?;
            if stale.is_empty() {
                println!("no stale syncs");
            }
            for entry in stale {
                println!(
                    "{} waiting on {} (expected {}, saw {})",
                    entry.note_id, entry.origin, entry.expected, entry.highest
                );
            }
        }
    }

    Ok(())
}
