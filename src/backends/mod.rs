//! Remote identity services and the plumbing used to call them.
//!
//! The enrichment manager only sees the [`FingerprintBackend`] and
//! [`MetadataBackend`] traits; `acoustid` and `musicbrainz` hold the `ureq`
//! implementations, while `rate_limiter` and `retry` wrap every call.

pub mod acoustid;
pub mod clock;
pub mod musicbrainz;
pub mod rate_limiter;
pub mod retry;

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::config::ClientIdentity;
use crate::error::ResolveError;

/// One `{name, joinphrase}` entry of an artist credit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArtistCredit {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub joinphrase: Option<String>,
    #[serde(default)]
    pub artist: Option<CreditedArtist>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreditedArtist {
    #[serde(default)]
    pub name: Option<String>,
}

/// Recording entry attached to a fingerprint match.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MatchedRecording {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artists: Vec<ArtistCredit>,
}

/// One scored result from the fingerprint service.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FingerprintMatch {
    pub score: f64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub recordings: Vec<MatchedRecording>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReleaseGroup {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "first-release-date", default)]
    pub first_release_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediumTrack {
    #[serde(default)]
    pub number: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Medium {
    #[serde(default)]
    pub position: Option<Value>,
    // Recording lookups list the matched track under `track`.
    #[serde(default, alias = "track")]
    pub tracks: Vec<MediumTrack>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Release {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(rename = "artist-credit", default)]
    pub artist_credit: Vec<ArtistCredit>,
    #[serde(rename = "release-group", default)]
    pub release_group: Option<ReleaseGroup>,
    #[serde(default)]
    pub media: Vec<Medium>,
}

/// Recording lookup result including its releases.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Recording {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "artist-credit", default)]
    pub artist_credit: Vec<ArtistCredit>,
    #[serde(default)]
    pub releases: Vec<Release>,
}

/// Entry of a release's cover-art image list.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CoverImage {
    #[serde(default)]
    pub front: bool,
    #[serde(default)]
    pub image: Option<String>,
}

/// Maps an audio file to scored candidate recording identities.
pub trait FingerprintBackend: Send + Sync {
    fn lookup(&self, api_key: &str, path: &Path) -> Result<Vec<FingerprintMatch>, ResolveError>;
}

/// Resolves recording identities to releases and cover art.
pub trait MetadataBackend: Send + Sync {
    fn recording(
        &self,
        identity: &ClientIdentity,
        recording_id: &str,
    ) -> Result<Recording, ResolveError>;

    fn release_images(
        &self,
        identity: &ClientIdentity,
        release_id: &str,
    ) -> Result<Vec<CoverImage>, ResolveError>;
}

/// Classifies a `ureq` failure into the retryable/non-retryable split.
pub(crate) fn classify_ureq_error(service: &str, error: ureq::Error) -> ResolveError {
    match error {
        ureq::Error::Status(code, _) => match code {
            408 | 429 | 500 | 502 | 503 | 504 => {
                ResolveError::Transient(format!("{service} returned HTTP {code}"))
            }
            _ => ResolveError::NonTransient(format!("{service} returned HTTP {code}")),
        },
        ureq::Error::Transport(transport) => {
            ResolveError::Transient(format!("{service} request failed: {transport}"))
        }
    }
}
