//! MusicBrainz recording lookups and Cover Art Archive image lists.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{classify_ureq_error, CoverImage, MetadataBackend, Recording};
use crate::config::ClientIdentity;
use crate::error::ResolveError;

const MUSICBRAINZ_BASE_URL: &str = "https://musicbrainz.org/ws/2";
const COVER_ART_ARCHIVE_BASE_URL: &str = "https://coverartarchive.org";
const RECORDING_INCLUDES: &[&str] = &["artists", "releases", "release-groups"];

#[derive(Debug, Deserialize)]
struct ImageListResponse {
    #[serde(default)]
    images: Vec<CoverImage>,
}

/// Metadata backend backed by the public MusicBrainz web service.
pub struct MusicBrainzClient {
    http_client: ureq::Agent,
    base_url: String,
    cover_art_base_url: String,
}

impl MusicBrainzClient {
    pub fn new(request_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .build();
        Self {
            http_client,
            base_url: MUSICBRAINZ_BASE_URL.to_string(),
            cover_art_base_url: COVER_ART_ARCHIVE_BASE_URL.to_string(),
        }
    }

    fn recording_url(&self, recording_id: &str) -> String {
        format!(
            "{}/recording/{}?inc={}&fmt=json",
            self.base_url,
            urlencoding::encode(recording_id),
            RECORDING_INCLUDES.join("+")
        )
    }

    fn image_list_url(&self, release_id: &str) -> String {
        format!(
            "{}/release/{}",
            self.cover_art_base_url,
            urlencoding::encode(release_id)
        )
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &str,
        identity: &ClientIdentity,
    ) -> Result<T, ResolveError> {
        let response = self
            .http_client
            .get(url)
            .set("User-Agent", &identity.user_agent())
            .set("Accept", "application/json")
            .call()
            .map_err(|error| classify_ureq_error(service, error))?;
        response.into_json().map_err(|error| {
            if error.kind() == std::io::ErrorKind::InvalidData {
                ResolveError::NonTransient(format!("{service} returned invalid JSON: {error}"))
            } else {
                ResolveError::Transient(format!("{service} response read failed: {error}"))
            }
        })
    }
}

impl MetadataBackend for MusicBrainzClient {
    fn recording(
        &self,
        identity: &ClientIdentity,
        recording_id: &str,
    ) -> Result<Recording, ResolveError> {
        self.get_json("MusicBrainz", &self.recording_url(recording_id), identity)
    }

    fn release_images(
        &self,
        identity: &ClientIdentity,
        release_id: &str,
    ) -> Result<Vec<CoverImage>, ResolveError> {
        let list: ImageListResponse =
            self.get_json("Cover Art Archive", &self.image_list_url(release_id), identity)?;
        Ok(list.images)
    }
}
