//! Tag write-back for resolved candidates, backed by `lofty`.

use std::path::Path;

use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::{ItemKey, Tag};

use crate::protocol::Candidate;

/// Writes the candidate's present fields into the file's primary tag.
///
/// Absent candidate fields leave existing tag values untouched. The primary
/// tag is created when the file has none yet.
pub fn write_track_tags(path: &Path, candidate: &Candidate) -> Result<(), String> {
    let mut tagged_file =
        read_from_path(path).map_err(|error| format!("Failed to read tags: {error}"))?;
    let tag_type = tagged_file.primary_tag_type();
    if tagged_file.tag(tag_type).is_none() {
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let tag = tagged_file
        .tag_mut(tag_type)
        .ok_or_else(|| format!("No writable tag available for {:?}", tag_type))?;

    apply_candidate_fields(tag, candidate);

    tagged_file
        .save_to_path(path, WriteOptions::default())
        .map_err(|error| format!("Failed to write tags: {error}"))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn apply_candidate_fields(tag: &mut Tag, candidate: &Candidate) {
    if let Some(title) = non_empty(&candidate.title) {
        tag.set_title(title.to_string());
    }
    if let Some(artist) = non_empty(&candidate.artist) {
        tag.set_artist(artist.to_string());
    }
    if let Some(album) = non_empty(&candidate.album) {
        tag.set_album(album.to_string());
    }
    if let Some(album_artist) = non_empty(&candidate.album_artist) {
        tag.insert_text(ItemKey::AlbumArtist, album_artist.to_string());
    }
    if let Some(year) = candidate.year {
        tag.remove_key(ItemKey::RecordingDate);
        tag.insert_text(ItemKey::RecordingDate, year.to_string());
    }
    if let Some(track_no) = candidate.track_no.filter(|number| *number > 0) {
        tag.insert_text(ItemKey::TrackNumber, track_no.to_string());
    }
    if let Some(disc_no) = candidate.disc_no.filter(|number| *number > 0) {
        tag.insert_text(ItemKey::DiscNumber, disc_no.to_string());
    }
}
