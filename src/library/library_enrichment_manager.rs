//! Fingerprint-driven identity enrichment for library tracks.
//!
//! Each file goes through: fingerprint cache check, fingerprint lookup,
//! per-recording metadata lookup, candidate scoring, and persistence of the
//! best candidate above the confidence threshold. Every remote call is spaced
//! by its service's [`RateLimiter`] and wrapped in the shared [`RetryPolicy`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::candidate_resolver::{
    build_candidate, front_cover_url, resolvable_recordings, select_release,
};
use super::fingerprint_cache::{CacheKey, FingerprintCache};
use crate::backends::clock::{Clock, SystemClock};
use crate::backends::rate_limiter::{RateLimiter, DEFAULT_INTERVAL};
use crate::backends::retry::RetryPolicy;
use crate::backends::{FingerprintBackend, MetadataBackend};
use crate::config::{EnrichmentConfig, EnrichmentCredentials};
use crate::db_manager::DbManager;
use crate::error::ResolveError;
use crate::metadata::metadata_tags::write_track_tags;
use crate::protocol::{Candidate, EnrichOutcome, EnrichedTrack, FingerprintStatus};

/// Per-invocation knobs for one enrichment run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrichOptions {
    pub min_confidence: f64,
    pub write_tags: bool,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            write_tags: false,
        }
    }
}

impl From<&EnrichmentConfig> for EnrichOptions {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            write_tags: config.write_tags,
        }
    }
}

/// Minimum spacing between calls to each remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIntervals {
    pub fingerprint: Duration,
    pub metadata: Duration,
}

impl Default for ServiceIntervals {
    fn default() -> Self {
        Self {
            fingerprint: DEFAULT_INTERVAL,
            metadata: DEFAULT_INTERVAL,
        }
    }
}

impl From<&EnrichmentConfig> for ServiceIntervals {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            fingerprint: Duration::from_millis(config.acoustid_interval_ms),
            metadata: Duration::from_millis(config.musicbrainz_interval_ms),
        }
    }
}

/// Resolves track identities against remote services and persists the results.
pub struct LibraryEnrichmentManager {
    db_manager: DbManager,
    fingerprint_backend: Box<dyn FingerprintBackend>,
    metadata_backend: Box<dyn MetadataBackend>,
    fingerprint_limiter: RateLimiter,
    metadata_limiter: RateLimiter,
    retry_policy: RetryPolicy,
    cancel_flag: Arc<AtomicBool>,
}

impl LibraryEnrichmentManager {
    pub fn new(
        db_manager: DbManager,
        fingerprint_backend: Box<dyn FingerprintBackend>,
        metadata_backend: Box<dyn MetadataBackend>,
        intervals: ServiceIntervals,
    ) -> Self {
        Self::with_clock(
            db_manager,
            fingerprint_backend,
            metadata_backend,
            intervals,
            Arc::new(SystemClock),
        )
    }

    /// Builds a manager whose limiters and backoff share `clock`.
    pub fn with_clock(
        db_manager: DbManager,
        fingerprint_backend: Box<dyn FingerprintBackend>,
        metadata_backend: Box<dyn MetadataBackend>,
        intervals: ServiceIntervals,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db_manager,
            fingerprint_backend,
            metadata_backend,
            fingerprint_limiter: RateLimiter::new(
                "acoustid",
                intervals.fingerprint,
                clock.clone(),
            ),
            metadata_limiter: RateLimiter::new("musicbrainz", intervals.metadata, clock.clone()),
            retry_policy: RetryPolicy::new(clock),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn db(&self) -> &DbManager {
        &self.db_manager
    }

    /// Flag checked between files; setting it stops a batch after the current file.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Enriches one file using credentials from the process environment.
    pub fn enrich_file(
        &self,
        path: &Path,
        options: &EnrichOptions,
    ) -> Result<EnrichOutcome, ResolveError> {
        let credentials = EnrichmentCredentials::from_env()?;
        self.enrich_file_with(&credentials, path, options)
    }

    /// Enriches one file.
    ///
    /// A remote failure that survives retries marks the track `error` and is
    /// returned; no cache entry is written in that case.
    pub fn enrich_file_with(
        &self,
        credentials: &EnrichmentCredentials,
        path: &Path,
        options: &EnrichOptions,
    ) -> Result<EnrichOutcome, ResolveError> {
        let path_key = path.to_string_lossy().into_owned();
        let cache_key = CacheKey::for_file(path)?;
        let cache = FingerprintCache::new(&self.db_manager);

        if let Some(cached) = cache.lookup(&cache_key)? {
            if cached.confidence >= options.min_confidence {
                debug!(
                    "Enrichment: cache hit for {} (confidence {:.2})",
                    path_key, cached.confidence
                );
                if self.apply(path, &cached.candidate, options)? {
                    cache.store(&CacheKey::for_file(path)?, &cached.candidate)?;
                }
                return Ok(EnrichOutcome::Updated {
                    candidate: cached.candidate,
                    from_cache: true,
                });
            }
        }

        self.db_manager
            .set_fingerprint_status(&path_key, FingerprintStatus::Pending)?;

        let best = match self.resolve_best_candidate(credentials, path) {
            Ok(best) => best,
            Err(error) => {
                warn!("Enrichment failed for {}: {}", path_key, error);
                if let Err(db_error) = self
                    .db_manager
                    .set_fingerprint_status(&path_key, FingerprintStatus::Error)
                {
                    warn!("Cannot record error status for {}: {}", path_key, db_error);
                }
                return Err(error);
            }
        };

        match best {
            Some(candidate) if candidate.confidence >= options.min_confidence => {
                let cache_key = if self.apply(path, &candidate, options)? {
                    CacheKey::for_file(path)?
                } else {
                    cache_key
                };
                cache.store(&cache_key, &candidate)?;
                Ok(EnrichOutcome::Updated {
                    candidate,
                    from_cache: false,
                })
            }
            best => {
                let best_confidence = best.map(|candidate| candidate.confidence);
                debug!(
                    "Enrichment: no acceptable match for {} (best {:?})",
                    path_key, best_confidence
                );
                self.db_manager
                    .set_fingerprint_status(&path_key, FingerprintStatus::Done)?;
                Ok(EnrichOutcome::NoMatch { best_confidence })
            }
        }
    }

    /// Enriches up to `limit` incomplete tracks, newest first.
    ///
    /// Missing credentials fail the whole batch before any file is touched.
    /// Per-file failures are logged and skipped.
    pub fn enrich_library(
        &self,
        limit: usize,
        options: &EnrichOptions,
    ) -> Result<Vec<EnrichedTrack>, ResolveError> {
        let credentials = EnrichmentCredentials::from_env()?;
        self.enrich_library_with(&credentials, limit, options)
    }

    pub fn enrich_library_with(
        &self,
        credentials: &EnrichmentCredentials,
        limit: usize,
        options: &EnrichOptions,
    ) -> Result<Vec<EnrichedTrack>, ResolveError> {
        let tracks = self.db_manager.tracks_needing_enrichment(limit)?;
        info!("Enrichment: {} track(s) need metadata", tracks.len());

        let mut enriched = Vec::new();
        for track in tracks {
            if self.cancel_flag.load(Ordering::Relaxed) {
                info!("Enrichment: cancelled, stopping before {}", track.path);
                break;
            }
            let path = Path::new(&track.path);
            if !path.exists() {
                debug!("Enrichment: marking missing file {}", track.path);
                self.db_manager.mark_missing(&track.path)?;
                continue;
            }
            match self.enrich_file_with(credentials, path, options) {
                Ok(EnrichOutcome::Updated {
                    candidate,
                    from_cache,
                }) => enriched.push(EnrichedTrack {
                    path: track.path,
                    candidate,
                    from_cache,
                }),
                Ok(EnrichOutcome::NoMatch { .. }) => {}
                Err(error) => {
                    warn!("Enrichment: skipping {}: {}", track.path, error);
                }
            }
        }
        Ok(enriched)
    }

    fn resolve_best_candidate(
        &self,
        credentials: &EnrichmentCredentials,
        path: &Path,
    ) -> Result<Option<Candidate>, ResolveError> {
        let matches = self.retry_policy.run("acoustid lookup", || {
            self.fingerprint_limiter.wait();
            self.fingerprint_backend
                .lookup(&credentials.acoustid_api_key, path)
        })?;

        let mut best: Option<Candidate> = None;
        for (fingerprint, matched, recording_id) in resolvable_recordings(&matches) {
            let recording = self.retry_policy.run("musicbrainz recording", || {
                self.metadata_limiter.wait();
                self.metadata_backend
                    .recording(&credentials.identity, recording_id)
            })?;
            let Some(release) = select_release(&recording.releases) else {
                debug!("Enrichment: recording {} has no releases", recording_id);
                continue;
            };
            let cover_art_url = self.front_cover_url(credentials, &release.id);
            let candidate =
                build_candidate(fingerprint, matched, &recording, release, cover_art_url);
            let improves = best
                .as_ref()
                .map(|current| candidate.confidence > current.confidence)
                .unwrap_or(true);
            if improves {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    fn front_cover_url(
        &self,
        credentials: &EnrichmentCredentials,
        release_id: &str,
    ) -> Option<String> {
        let images = self.retry_policy.run("cover art list", || {
            self.metadata_limiter.wait();
            self.metadata_backend
                .release_images(&credentials.identity, release_id)
        });
        match images {
            Ok(images) => front_cover_url(&images),
            Err(error) => {
                debug!("Enrichment: no cover art for release {}: {}", release_id, error);
                None
            }
        }
    }

    /// Persists `candidate` and optionally writes it into the file's tags.
    ///
    /// Returns `true` when the file was rewritten, so its cache key is stale.
    fn apply(
        &self,
        path: &Path,
        candidate: &Candidate,
        options: &EnrichOptions,
    ) -> Result<bool, ResolveError> {
        self.db_manager
            .apply_candidate(&path.to_string_lossy(), candidate)?;
        if !options.write_tags {
            return Ok(false);
        }
        match write_track_tags(path, candidate) {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("Cannot write tags for {}: {}", path.display(), error);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::{EnrichOptions, LibraryEnrichmentManager, ServiceIntervals};
    use crate::backends::clock::ManualClock;
    use crate::backends::{
        ArtistCredit, CoverImage, FingerprintBackend, FingerprintMatch, MatchedRecording,
        MetadataBackend, Recording, Release,
    };
    use crate::config::{ClientIdentity, EnrichmentCredentials};
    use crate::db_manager::DbManager;
    use crate::error::ResolveError;
    use crate::protocol::{EnrichOutcome, FingerprintStatus, TrackRecord};

    type LookupScript = Arc<Mutex<Vec<Result<Vec<FingerprintMatch>, ResolveError>>>>;

    /// Replays scripted results, then repeats the last successful response.
    struct ScriptedFingerprints {
        script: LookupScript,
        fallback: Vec<FingerprintMatch>,
        calls: Arc<AtomicUsize>,
    }

    impl FingerprintBackend for ScriptedFingerprints {
        fn lookup(
            &self,
            _api_key: &str,
            _path: &Path,
        ) -> Result<Vec<FingerprintMatch>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(self.fallback.clone())
            } else {
                script.remove(0)
            }
        }
    }

    type FailureBudget = Arc<Mutex<HashMap<String, usize>>>;

    /// Serves fixed recordings after failing each id transiently as often as budgeted.
    struct StaticMetadata {
        recordings: HashMap<String, Recording>,
        transient_failures: FailureBudget,
        calls: Arc<AtomicUsize>,
    }

    impl MetadataBackend for StaticMetadata {
        fn recording(
            &self,
            _identity: &ClientIdentity,
            recording_id: &str,
        ) -> Result<Recording, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(remaining) = self
                .transient_failures
                .lock()
                .unwrap()
                .get_mut(recording_id)
                .filter(|remaining| **remaining > 0)
            {
                *remaining -= 1;
                return Err(ResolveError::Transient(format!("HTTP 503 for {recording_id}")));
            }
            self.recordings
                .get(recording_id)
                .cloned()
                .ok_or_else(|| ResolveError::NonTransient(format!("unknown {recording_id}")))
        }

        fn release_images(
            &self,
            _identity: &ClientIdentity,
            _release_id: &str,
        ) -> Result<Vec<CoverImage>, ResolveError> {
            Err(ResolveError::NonTransient("HTTP 404".to_string()))
        }
    }

    struct Harness {
        manager: LibraryEnrichmentManager,
        clock: Arc<ManualClock>,
        lookups: Arc<AtomicUsize>,
        metadata_calls: Arc<AtomicUsize>,
        metadata_failures: FailureBudget,
        script: LookupScript,
    }

    fn credentials() -> EnrichmentCredentials {
        EnrichmentCredentials {
            acoustid_api_key: "test-key".to_string(),
            identity: ClientIdentity::default(),
        }
    }

    fn unique_temp_path(name: &str) -> PathBuf {
        unique_temp_path_with_extension(name, "mp3")
    }

    fn unique_temp_path_with_extension(name: &str, extension: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("songsearch_{name}_{nonce}.{extension}"))
    }

    /// Two seconds of 16-bit mono silence as a canonical PCM WAV file.
    fn silent_wav() -> Vec<u8> {
        let sample_rate: u32 = 44_100;
        let data_len = sample_rate * 2 * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(44 + data_len as usize, 0);
        bytes
    }

    fn fingerprint_match(score: f64, recording_id: &str) -> FingerprintMatch {
        FingerprintMatch {
            score,
            id: Some(format!("acoustid-{recording_id}")),
            recordings: vec![MatchedRecording {
                id: Some(recording_id.to_string()),
                title: Some(format!("Title {recording_id}")),
                artists: vec![ArtistCredit {
                    name: Some("Artist".to_string()),
                    joinphrase: None,
                    artist: None,
                }],
            }],
        }
    }

    fn recording(recording_id: &str) -> Recording {
        Recording {
            id: recording_id.to_string(),
            title: None,
            artist_credit: Vec::new(),
            releases: vec![Release {
                id: format!("release-{recording_id}"),
                title: Some("Album".to_string()),
                date: Some("2001-02-03".to_string()),
                ..Release::default()
            }],
        }
    }

    fn harness(matches: Vec<FingerprintMatch>) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let lookups = Arc::new(AtomicUsize::new(0));
        let metadata_calls = Arc::new(AtomicUsize::new(0));
        let script: LookupScript = Arc::new(Mutex::new(Vec::new()));
        let metadata_failures: FailureBudget = Arc::new(Mutex::new(HashMap::new()));
        let recordings = matches
            .iter()
            .flat_map(|m| m.recordings.iter())
            .filter_map(|r| r.id.clone())
            .map(|id| (id.clone(), recording(&id)))
            .collect();
        let manager = LibraryEnrichmentManager::with_clock(
            DbManager::open_in_memory().unwrap(),
            Box::new(ScriptedFingerprints {
                script: script.clone(),
                fallback: matches,
                calls: lookups.clone(),
            }),
            Box::new(StaticMetadata {
                recordings,
                transient_failures: metadata_failures.clone(),
                calls: metadata_calls.clone(),
            }),
            ServiceIntervals::default(),
            clock.clone(),
        );
        Harness {
            manager,
            clock,
            lookups,
            metadata_calls,
            metadata_failures,
            script,
        }
    }

    fn register_file(manager: &LibraryEnrichmentManager, name: &str, contents: &[u8]) -> PathBuf {
        register_file_at(manager, unique_temp_path(name), contents)
    }

    fn register_file_at(
        manager: &LibraryEnrichmentManager,
        path: PathBuf,
        contents: &[u8],
    ) -> PathBuf {
        fs::write(&path, contents).unwrap();
        manager
            .db()
            .upsert_track(&TrackRecord {
                path: path.to_string_lossy().into_owned(),
                format: Some("mp3".to_string()),
                duration: Some(200.0),
                file_size: Some(contents.len() as i64),
                ..TrackRecord::default()
            })
            .unwrap();
        path
    }

    #[test]
    fn test_best_candidate_is_applied_and_cached() {
        let harness = harness(vec![
            fingerprint_match(0.7, "rec-low"),
            fingerprint_match(0.92, "rec-high"),
        ]);
        let path = register_file(&harness.manager, "apply", b"audio");

        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        match outcome {
            EnrichOutcome::Updated {
                candidate,
                from_cache,
            } => {
                assert!(!from_cache);
                assert_eq!(candidate.recording_id, "rec-high");
                assert_eq!(candidate.cover_art_url, None);
            }
            other => panic!("expected update, got {other:?}"),
        }
        let stored = harness
            .manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::Done);
        assert_eq!(stored.mb_recording_id.as_deref(), Some("rec-high"));
        assert_eq!(stored.year, Some(2001));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_second_run_on_unchanged_file_is_served_from_cache() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let path = register_file(&harness.manager, "cache_hit", b"audio");
        let options = EnrichOptions::default();

        harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();
        let second = harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();

        assert!(matches!(
            second,
            EnrichOutcome::Updated {
                from_cache: true,
                ..
            }
        ));
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(harness.metadata_calls.load(Ordering::SeqCst), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_changed_size_or_mtime_invalidates_cache() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let path = register_file(&harness.manager, "cache_miss", b"audio");
        let options = EnrichOptions::default();

        harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();
        fs::write(&path, b"longer audio").unwrap();
        harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 2);

        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        drop(file);
        harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 3);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_candidate_below_threshold_is_not_applied() {
        let harness = harness(vec![fingerprint_match(0.4, "rec-1")]);
        let path = register_file(&harness.manager, "below", b"audio");

        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        assert_eq!(
            outcome,
            EnrichOutcome::NoMatch {
                best_confidence: Some(0.4)
            }
        );
        let stored = harness
            .manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::Done);
        assert_eq!(stored.title, None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_lower_cached_confidence_than_threshold_triggers_lookup() {
        let harness = harness(vec![fingerprint_match(0.7, "rec-1")]);
        let path = register_file(&harness.manager, "strict", b"audio");

        harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();
        let strict = EnrichOptions {
            min_confidence: 0.8,
            write_tags: false,
        };
        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &strict)
            .unwrap();

        assert!(matches!(outcome, EnrichOutcome::NoMatch { .. }));
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_exhausted_retries_mark_track_as_error() {
        let harness = harness(Vec::new());
        harness.script.lock().unwrap().extend([
            Err(ResolveError::Transient("timeout 1".to_string())),
            Err(ResolveError::Transient("timeout 2".to_string())),
            Err(ResolveError::Transient("timeout 3".to_string())),
        ]);
        let path = register_file(&harness.manager, "exhausted", b"audio");

        let result =
            harness
                .manager
                .enrich_file_with(&credentials(), &path, &EnrichOptions::default());

        assert!(matches!(result, Err(ResolveError::Transient(_))));
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 3);
        let stored = harness
            .manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::Error);
        let cache_key = super::CacheKey::for_file(&path).unwrap();
        assert!(super::FingerprintCache::new(harness.manager.db())
            .lookup(&cache_key)
            .unwrap()
            .is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_two_transient_failures_then_success_updates_track() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        harness.script.lock().unwrap().extend([
            Err(ResolveError::Transient("reset".to_string())),
            Err(ResolveError::Transient("reset".to_string())),
        ]);
        let path = register_file(&harness.manager, "recovers", b"audio");

        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        assert!(matches!(outcome, EnrichOutcome::Updated { .. }));
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 3);
        let sleeps = harness.clock.sleeps();
        assert!(sleeps.contains(&Duration::from_secs(2)));
        assert!(sleeps.contains(&Duration::from_secs(4)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_tag_write_failure_still_updates_database() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let path = register_file(&harness.manager, "junk_tags", b"definitely not an mp3");
        let options = EnrichOptions {
            min_confidence: 0.6,
            write_tags: true,
        };

        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();

        assert!(matches!(outcome, EnrichOutcome::Updated { .. }));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_batch_marks_missing_files_and_continues() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let present = register_file(&harness.manager, "present", b"audio");
        let gone = unique_temp_path("gone");
        harness
            .manager
            .db()
            .upsert_track(&TrackRecord {
                path: gone.to_string_lossy().into_owned(),
                ..TrackRecord::default()
            })
            .unwrap();

        let enriched = harness
            .manager
            .enrich_library_with(&credentials(), 10, &EnrichOptions::default())
            .unwrap();

        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].path, present.to_string_lossy());
        let missing = harness
            .manager
            .db()
            .get_by_path(&gone.to_string_lossy())
            .unwrap()
            .unwrap();
        assert!(missing.missing);
        let _ = fs::remove_file(&present);
    }

    #[test]
    fn test_cancelled_batch_processes_nothing() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let path = register_file(&harness.manager, "cancelled", b"audio");
        harness
            .manager
            .cancel_handle()
            .store(true, Ordering::Relaxed);

        let enriched = harness
            .manager
            .enrich_library_with(&credentials(), 10, &EnrichOptions::default())
            .unwrap();

        assert!(enriched.is_empty());
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_metadata_calls_are_rate_limited() {
        let harness = harness(vec![
            fingerprint_match(0.7, "rec-a"),
            fingerprint_match(0.8, "rec-b"),
        ]);
        let path = register_file(&harness.manager, "limited", b"audio");

        harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        // Two recording lookups plus two cover-art lookups on one limiter.
        let limiter_sleeps = harness
            .clock
            .sleeps()
            .into_iter()
            .filter(|sleep| *sleep == Duration::from_millis(1100))
            .count();
        assert_eq!(limiter_sleeps, 3);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_files_rewritten_by_tag_write_are_served_from_cache_next_time() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let wav = silent_wav();
        let path = register_file_at(
            &harness.manager,
            unique_temp_path_with_extension("tagged", "wav"),
            &wav,
        );
        let options = EnrichOptions {
            min_confidence: 0.6,
            write_tags: true,
        };

        harness
            .manager
            .enrich_file_with(&credentials(), &path, &options)
            .unwrap();
        assert_ne!(fs::metadata(&path).unwrap().len(), wav.len() as u64);

        for _ in 0..2 {
            let outcome = harness
                .manager
                .enrich_file_with(&credentials(), &path, &options)
                .unwrap();
            assert!(matches!(
                outcome,
                EnrichOutcome::Updated {
                    from_cache: true,
                    ..
                }
            ));
        }
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_metadata_failure_surviving_retries_marks_track_as_error() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        harness
            .metadata_failures
            .lock()
            .unwrap()
            .insert("rec-1".to_string(), 3);
        let path = register_file(&harness.manager, "metadata_down", b"audio");

        let result =
            harness
                .manager
                .enrich_file_with(&credentials(), &path, &EnrichOptions::default());

        assert!(matches!(result, Err(ResolveError::Transient(_))));
        assert_eq!(harness.metadata_calls.load(Ordering::SeqCst), 3);
        let stored = harness
            .manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::Error);
        assert_eq!(stored.mb_recording_id, None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_each_metadata_lookup_gets_its_own_attempt_budget() {
        let harness = harness(vec![
            fingerprint_match(0.7, "rec-a"),
            fingerprint_match(0.8, "rec-b"),
        ]);
        harness.metadata_failures.lock().unwrap().extend([
            ("rec-a".to_string(), 2),
            ("rec-b".to_string(), 2),
        ]);
        let path = register_file(&harness.manager, "budget", b"audio");

        let outcome = harness
            .manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        match outcome {
            EnrichOutcome::Updated { candidate, .. } => {
                assert_eq!(candidate.recording_id, "rec-b")
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(harness.metadata_calls.load(Ordering::SeqCst), 6);
        let _ = fs::remove_file(&path);
    }

    /// Reads the track's status through a second connection during the lookup.
    struct StatusObservingFingerprints {
        db_path: PathBuf,
        observed: Arc<Mutex<Option<FingerprintStatus>>>,
    }

    impl FingerprintBackend for StatusObservingFingerprints {
        fn lookup(
            &self,
            _api_key: &str,
            path: &Path,
        ) -> Result<Vec<FingerprintMatch>, ResolveError> {
            let db = DbManager::open(&self.db_path).unwrap();
            let track = db.get_by_path(&path.to_string_lossy()).unwrap();
            *self.observed.lock().unwrap() = track.map(|track| track.fingerprint_status);
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_pending_status_is_committed_before_fingerprint_lookup() {
        let db_path = unique_temp_path_with_extension("pending", "db");
        let observed = Arc::new(Mutex::new(None));
        let manager = LibraryEnrichmentManager::with_clock(
            DbManager::open(&db_path).unwrap(),
            Box::new(StatusObservingFingerprints {
                db_path: db_path.clone(),
                observed: observed.clone(),
            }),
            Box::new(StaticMetadata {
                recordings: HashMap::new(),
                transient_failures: Arc::new(Mutex::new(HashMap::new())),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            ServiceIntervals::default(),
            Arc::new(ManualClock::new()),
        );
        let path = register_file(&manager, "pending", b"audio");

        let outcome = manager
            .enrich_file_with(&credentials(), &path, &EnrichOptions::default())
            .unwrap();

        assert_eq!(
            outcome,
            EnrichOutcome::NoMatch {
                best_confidence: None
            }
        );
        assert_eq!(*observed.lock().unwrap(), Some(FingerprintStatus::Pending));
        let stored = manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::Done);
        drop(manager);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn test_missing_api_key_aborts_batch_before_any_lookup() {
        let harness = harness(vec![fingerprint_match(0.9, "rec-1")]);
        let path = register_file(&harness.manager, "no_key", b"audio");
        std::env::remove_var("ACOUSTID_API_KEY");

        let result = harness
            .manager
            .enrich_library(10, &EnrichOptions::default());

        assert!(matches!(result, Err(ResolveError::Config(_))));
        assert_eq!(harness.lookups.load(Ordering::SeqCst), 0);
        let stored = harness
            .manager
            .db()
            .get_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(stored.fingerprint_status, FingerprintStatus::None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_failed_error_status_write_keeps_remote_error() {
        let db_path = unique_temp_path_with_extension("status_write", "db");
        let script: LookupScript = Arc::new(Mutex::new(vec![Err(ResolveError::NonTransient(
            "acoustid status: error (invalid API key)".to_string(),
        ))]));
        let manager = LibraryEnrichmentManager::with_clock(
            DbManager::open(&db_path).unwrap(),
            Box::new(ScriptedFingerprints {
                script,
                fallback: Vec::new(),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(StaticMetadata {
                recordings: HashMap::new(),
                transient_failures: Arc::new(Mutex::new(HashMap::new())),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            ServiceIntervals::default(),
            Arc::new(ManualClock::new()),
        );
        let path = register_file(&manager, "status_write", b"audio");
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_error_status BEFORE UPDATE ON tracks
                 WHEN NEW.fp_status = 'error'
                 BEGIN SELECT RAISE(ABORT, 'status locked'); END;",
            )
            .unwrap();

        let result = manager.enrich_file_with(&credentials(), &path, &EnrichOptions::default());

        match result {
            Err(ResolveError::NonTransient(message)) => {
                assert!(message.contains("invalid API key"))
            }
            other => panic!("expected the lookup error, got {other:?}"),
        }
        drop(manager);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&db_path);
    }
}
