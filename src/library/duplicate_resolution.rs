//! Keeper selection and relocation of redundant duplicate files.

use std::cmp::Ordering;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::db_manager::DbManager;
use crate::error::ResolveError;
use crate::protocol::TrackRecord;

// Lossless containers first, then lossy codecs by typical fidelity.
const FORMAT_RANKS: &[(&str, u32)] = &[
    ("flac", 400),
    ("alac", 390),
    ("wav", 380),
    ("aiff", 370),
    ("aif", 360),
    ("ape", 350),
    ("wv", 340),
    ("m4a", 260),
    ("aac", 250),
    ("ogg", 220),
    ("opus", 210),
    ("mp3", 200),
    ("wma", 180),
];

/// Quality rank of a container/codec name; unknown formats rank 0.
pub fn format_rank(format: Option<&str>) -> u32 {
    let Some(format) = format.map(|format| format.trim().to_lowercase()) else {
        return 0;
    };
    FORMAT_RANKS
        .iter()
        .find(|(name, _)| *name == format)
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

/// `(format rank, bitrate, file size, duration)` with absent values as zero.
pub fn quality_key(track: &TrackRecord) -> (u32, i64, i64, f64) {
    (
        format_rank(track.format.as_deref()),
        track.bitrate.unwrap_or(0),
        track.file_size.unwrap_or(0),
        track.duration.unwrap_or(0.0),
    )
}

fn compare_quality(left: &TrackRecord, right: &TrackRecord) -> Ordering {
    let (left_rank, left_bitrate, left_size, left_duration) = quality_key(left);
    let (right_rank, right_bitrate, right_size, right_duration) = quality_key(right);
    left_rank
        .cmp(&right_rank)
        .then(left_bitrate.cmp(&right_bitrate))
        .then(left_size.cmp(&right_size))
        .then(left_duration.total_cmp(&right_duration))
}

/// Highest-quality member of a cluster; ties keep the earliest member.
pub fn pick_keeper(cluster: &[TrackRecord]) -> Option<&TrackRecord> {
    cluster.iter().fold(None::<&TrackRecord>, |best, track| match best {
        Some(current) if compare_quality(track, current) != Ordering::Greater => Some(current),
        _ => Some(track),
    })
}

/// First free path for `file_name` inside `dir`, inserting ` (n)` before the extension.
pub fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    let extension = file_name.extension().map(|extension| extension.to_os_string());
    (1u32..)
        .map(|counter| {
            let mut name = OsString::from(&stem);
            name.push(format!(" ({counter})"));
            if let Some(extension) = &extension {
                name.push(".");
                name.push(extension);
            }
            dir.join(name)
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Which half of a relocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationPhase {
    /// The file could not be moved; disk and database are unchanged.
    Move,
    /// The file moved but its track row still points at the old path.
    Database,
}

/// One file relocated on disk with its track row updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, thiserror::Error)]
#[error("relocating {} to {} failed during {phase:?}: {message}", .from.display(), .to.display())]
pub struct RelocationError {
    pub phase: RelocationPhase,
    pub from: PathBuf,
    pub to: PathBuf,
    pub message: String,
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_error) => {
            debug!(
                "Rename {} -> {} failed ({}), falling back to copy",
                from.display(),
                to.display(),
                rename_error
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Moves `from` into `dest_dir` under a collision-free name, then repoints its track row.
pub fn relocate_file(
    db_manager: &DbManager,
    from: &Path,
    dest_dir: &Path,
) -> Result<Relocation, RelocationError> {
    let file_name = from.file_name().map(Path::new).unwrap_or(from);
    let to = unique_destination(dest_dir, file_name);
    let failure = |phase, message: String| RelocationError {
        phase,
        from: from.to_path_buf(),
        to: to.clone(),
        message,
    };

    move_file(from, &to).map_err(|error| failure(RelocationPhase::Move, error.to_string()))?;
    db_manager
        .relocate_track(&from.to_string_lossy(), &to.to_string_lossy())
        .map_err(|error| failure(RelocationPhase::Database, error.to_string()))?;
    Ok(Relocation {
        from: from.to_path_buf(),
        to,
    })
}

/// Outcome of resolving one duplicate cluster.
#[derive(Debug, Default)]
pub struct DuplicateResolution {
    pub keeper: Option<TrackRecord>,
    pub applied: Vec<Relocation>,
    pub failed: Vec<RelocationError>,
    /// Non-keeper members whose file was already gone.
    pub skipped: Vec<String>,
}

/// Keeps the best member of `cluster` in place and moves every other present file into `dest`.
pub fn resolve_move_others(
    db_manager: &DbManager,
    cluster: &[TrackRecord],
    dest: &Path,
) -> Result<DuplicateResolution, ResolveError> {
    fs::create_dir_all(dest)
        .map_err(|error| ResolveError::local_io(&dest.display().to_string(), &error))?;

    let Some(keeper) = pick_keeper(cluster) else {
        return Ok(DuplicateResolution::default());
    };
    let mut resolution = DuplicateResolution {
        keeper: Some(keeper.clone()),
        ..DuplicateResolution::default()
    };

    for track in cluster.iter().filter(|track| track.path != keeper.path) {
        let from = Path::new(&track.path);
        if !from.exists() {
            debug!("Duplicate {} is already gone, skipping", track.path);
            resolution.skipped.push(track.path.clone());
            continue;
        }
        match relocate_file(db_manager, from, dest) {
            Ok(relocation) => {
                info!(
                    "Moved duplicate {} -> {}",
                    relocation.from.display(),
                    relocation.to.display()
                );
                resolution.applied.push(relocation);
            }
            Err(error) => {
                warn!("{}", error);
                resolution.failed.push(error);
            }
        }
    }
    Ok(resolution)
}
