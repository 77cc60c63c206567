//! Data shapes shared by the enrichment and duplicate pipelines.
//!
//! `TrackRecord` mirrors one row of the `tracks` table; `Candidate` is the
//! transient result of resolving a single fingerprint match and doubles as the
//! payload persisted in the fingerprint cache.

/// Identity-resolution progress recorded per track in `tracks.fp_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintStatus {
    #[default]
    None,
    Pending,
    Done,
    Error,
}

impl FingerprintStatus {
    /// Column value persisted for this status; `None` is stored as SQL NULL.
    pub fn as_column_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pending => Some("pending"),
            Self::Done => Some("done"),
            Self::Error => Some("error"),
        }
    }

    pub fn from_column_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("pending") => Self::Pending,
            Some("done") => Self::Done,
            Some("error") => Self::Error,
            _ => Self::None,
        }
    }
}

/// One audio file known to the library database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackRecord {
    pub id: i64,
    pub path: String,
    pub format: Option<String>,
    /// Length in seconds.
    pub duration: Option<f64>,
    /// Size in bytes.
    pub file_size: Option<i64>,
    pub bitrate: Option<i64>,
    pub samplerate: Option<i64>,
    pub channels: Option<i64>,
    /// Modification time (seconds since the epoch) recorded by the scanner.
    pub mtime: Option<f64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub year: Option<i32>,
    pub track_no: Option<u32>,
    pub disc_no: Option<u32>,
    pub genre: Option<String>,
    pub fingerprint_status: FingerprintStatus,
    pub acoustid_id: Option<String>,
    pub mb_recording_id: Option<String>,
    pub mb_release_id: Option<String>,
    pub mb_release_group_id: Option<String>,
    pub confidence: Option<f64>,
    pub cover_art_url: Option<String>,
    /// Set once the file is no longer present on disk.
    pub missing: bool,
}

/// Canonical metadata resolved for one matched recording/release pair.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candidate {
    /// Fingerprint match score in `[0, 1]`.
    pub confidence: f64,
    pub acoustid_id: Option<String>,
    pub recording_id: String,
    pub release_id: String,
    pub release_group_id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub year: Option<i32>,
    pub track_no: Option<u32>,
    pub disc_no: Option<u32>,
    pub cover_art_url: Option<String>,
}

/// Result of enriching a single file.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    /// Candidate fields were written to the track row.
    Updated {
        candidate: Candidate,
        from_cache: bool,
    },
    /// Resolution finished without an acceptable candidate.
    NoMatch { best_confidence: Option<f64> },
}

/// A successful batch update, reported back to the batch caller.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedTrack {
    pub path: String,
    pub candidate: Candidate,
    pub from_cache: bool,
}
