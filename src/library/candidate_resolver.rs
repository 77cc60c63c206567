//! Turns fingerprint matches plus recording lookups into normalized candidates.

use serde_json::Value;

use crate::backends::{
    ArtistCredit, CoverImage, FingerprintMatch, MatchedRecording, Recording, Release,
};
use crate::protocol::Candidate;

// Sorts undated releases after every dated one.
const MISSING_DATE_SENTINEL: &str = "9999-99-99";

/// Every `(match, recording, recording id)` triple worth looking up, in response order.
pub fn resolvable_recordings(
    matches: &[FingerprintMatch],
) -> impl Iterator<Item = (&FingerprintMatch, &MatchedRecording, &str)> {
    matches.iter().flat_map(|fingerprint| {
        fingerprint.recordings.iter().filter_map(move |recording| {
            let id = recording.id.as_deref().map(str::trim)?;
            (!id.is_empty()).then_some((fingerprint, recording, id))
        })
    })
}

/// Concatenates `name + joinphrase` for each credit, skipping nameless entries.
pub fn join_artist_credit(credits: &[ArtistCredit]) -> Option<String> {
    let joined: String = credits
        .iter()
        .filter_map(|credit| {
            let name = credit
                .name
                .as_deref()
                .filter(|name| !name.is_empty())
                .or_else(|| {
                    credit
                        .artist
                        .as_ref()
                        .and_then(|artist| artist.name.as_deref())
                        .filter(|name| !name.is_empty())
                })?;
            Some(format!(
                "{name}{}",
                credit.joinphrase.as_deref().unwrap_or_default()
            ))
        })
        .collect();
    (!joined.is_empty()).then_some(joined)
}

/// Picks the release with the smallest date string; undated releases sort last.
///
/// This favors the earliest known pressing by plain string order. It is not a
/// true first-release-date resolution, and equal dates keep the first release.
pub fn select_release(releases: &[Release]) -> Option<&Release> {
    releases.iter().min_by(|left, right| release_sort_key(left).cmp(release_sort_key(right)))
}

fn release_sort_key(release: &Release) -> &str {
    release
        .date
        .as_deref()
        .filter(|date| !date.is_empty())
        .unwrap_or(MISSING_DATE_SENTINEL)
}

/// Integer value of the first four characters of a date.
pub fn parse_year(date: Option<&str>) -> Option<i32> {
    let date = date.filter(|date| !date.is_empty())?;
    date.chars().take(4).collect::<String>().trim().parse().ok()
}

fn value_to_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// URL of the first image flagged as the front cover.
pub fn front_cover_url(images: &[CoverImage]) -> Option<String> {
    images
        .iter()
        .find(|image| image.front)
        .and_then(|image| image.image.clone())
}

/// Builds the candidate for one matched recording and its selected release.
///
/// Title and artist prefer the fingerprint service's values and fall back to
/// the metadata lookup. Confidence is the fingerprint match score.
pub fn build_candidate(
    fingerprint: &FingerprintMatch,
    matched: &MatchedRecording,
    recording: &Recording,
    release: &Release,
    cover_art_url: Option<String>,
) -> Candidate {
    let release_group = release.release_group.as_ref();
    let date = release
        .date
        .as_deref()
        .filter(|date| !date.is_empty())
        .or_else(|| release_group.and_then(|group| group.first_release_date.as_deref()));
    let first_medium = release.media.first();

    let title = matched
        .title
        .clone()
        .filter(|title| !title.is_empty())
        .or_else(|| recording.title.clone());
    let artist =
        join_artist_credit(&matched.artists).or_else(|| join_artist_credit(&recording.artist_credit));
    let album_artist = join_artist_credit(&release.artist_credit)
        .or_else(|| join_artist_credit(&recording.artist_credit));

    Candidate {
        confidence: fingerprint.score,
        acoustid_id: fingerprint.id.clone(),
        recording_id: matched
            .id
            .clone()
            .unwrap_or_else(|| recording.id.clone()),
        release_id: release.id.clone(),
        release_group_id: release_group.and_then(|group| group.id.clone()),
        title,
        artist,
        album: release.title.clone(),
        album_artist,
        year: parse_year(date),
        track_no: first_medium
            .and_then(|medium| medium.tracks.first())
            .and_then(|track| value_to_u32(track.number.as_ref())),
        disc_no: first_medium.and_then(|medium| value_to_u32(medium.position.as_ref())),
        cover_art_url,
    }
}
