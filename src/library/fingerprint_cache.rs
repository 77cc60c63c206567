//! Memoized resolution results keyed by `(path, mtime, file size)`.
//!
//! Modification times are truncated to whole seconds before they become part
//! of the key, so sub-second precision differences between filesystems never
//! cause spurious misses. Any change of the truncated mtime or of the size
//! misses the cache.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::db_manager::DbManager;
use crate::error::ResolveError;
use crate::protocol::Candidate;

/// Identity of one file version on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub path: String,
    pub mtime_secs: i64,
    pub file_size: i64,
}

impl CacheKey {
    pub fn new(path: impl Into<String>, mtime: SystemTime, file_size: u64) -> Self {
        Self {
            path: path.into(),
            mtime_secs: unix_seconds(mtime),
            file_size: i64::try_from(file_size).unwrap_or(i64::MAX),
        }
    }

    /// Builds the key from the file's current metadata.
    pub fn for_file(path: &Path) -> Result<Self, ResolveError> {
        let metadata = fs::metadata(path)
            .map_err(|error| ResolveError::local_io(&path.display().to_string(), &error))?;
        let modified = metadata
            .modified()
            .map_err(|error| ResolveError::local_io(&path.display().to_string(), &error))?;
        Ok(Self::new(
            path.to_string_lossy().into_owned(),
            modified,
            metadata.len(),
        ))
    }
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

/// Cached best candidate for one file version.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCandidate {
    pub candidate: Candidate,
    pub confidence: f64,
}

/// Read/write view over the `fingerprint_cache` table.
pub struct FingerprintCache<'a> {
    db_manager: &'a DbManager,
}

impl<'a> FingerprintCache<'a> {
    pub fn new(db_manager: &'a DbManager) -> Self {
        Self { db_manager }
    }

    /// Returns the stored candidate only when all three key parts match.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CachedCandidate>, ResolveError> {
        let Some(row) =
            self.db_manager
                .get_fingerprint_cache(&key.path, key.mtime_secs, key.file_size)?
        else {
            return Ok(None);
        };
        match serde_json::from_str::<Candidate>(&row.payload) {
            Ok(candidate) => Ok(Some(CachedCandidate {
                candidate,
                confidence: row.confidence,
            })),
            Err(error) => {
                warn!(
                    "Ignoring unreadable fingerprint cache entry for {}: {}",
                    key.path, error
                );
                Ok(None)
            }
        }
    }

    /// Overwrites whatever is cached for the key's path.
    pub fn store(&self, key: &CacheKey, candidate: &Candidate) -> Result<(), ResolveError> {
        let payload = serde_json::to_string(candidate).map_err(|error| {
            ResolveError::LocalIo(format!("cannot encode cache payload: {error}"))
        })?;
        let now_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        self.db_manager.upsert_fingerprint_cache(
            &key.path,
            key.mtime_secs,
            key.file_size,
            &payload,
            candidate.confidence,
            now_unix_ms,
        )?;
        Ok(())
    }
}
