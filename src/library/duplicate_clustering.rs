//! Grouping of likely-duplicate tracks by format, size, and duration.
//!
//! Tracks are bucketed by `(lowercased format, file size)`. Within a bucket a
//! track joins the first open cluster whose duration span stays within
//! [`MAX_DURATION_SPREAD_SECS`] once it is added; otherwise it opens a new
//! cluster. Assignment is greedy and order-dependent, so rows should arrive in
//! a stable order (the database hands them out by ascending id).

use std::collections::HashMap;

use crate::protocol::TrackRecord;

/// Largest allowed `max - min` duration inside one cluster, in seconds.
pub const MAX_DURATION_SPREAD_SECS: f64 = 1.0;

struct OpenCluster {
    members: Vec<TrackRecord>,
    min_duration: f64,
    max_duration: f64,
}

impl OpenCluster {
    fn new(track: TrackRecord, duration: f64) -> Self {
        Self {
            members: vec![track],
            min_duration: duration,
            max_duration: duration,
        }
    }

    fn try_admit(&mut self, track: TrackRecord, duration: f64) -> Result<(), TrackRecord> {
        let new_min = self.min_duration.min(duration);
        let new_max = self.max_duration.max(duration);
        if new_max - new_min > MAX_DURATION_SPREAD_SECS {
            return Err(track);
        }
        self.min_duration = new_min;
        self.max_duration = new_max;
        self.members.push(track);
        Ok(())
    }
}

fn cluster_key(track: &TrackRecord) -> Option<(String, i64, f64)> {
    let duration = track
        .duration
        .filter(|duration| duration.is_finite() && *duration > 0.0)?;
    let size = track.file_size.filter(|size| *size > 0)?;
    let format = track
        .format
        .as_deref()
        .map(|format| format.trim().to_lowercase())
        .filter(|format| !format.is_empty())?;
    Some((format, size, duration))
}

/// Returns every cluster with at least two members.
///
/// Rows with a non-positive or non-finite duration, a non-positive size, or
/// an empty format are ignored. Clusters come out in order of first
/// appearance of their bucket, then of the cluster within its bucket.
pub fn find_duplicates<I>(rows: I) -> Vec<Vec<TrackRecord>>
where
    I: IntoIterator<Item = TrackRecord>,
{
    let mut bucket_index: HashMap<(String, i64), usize> = HashMap::new();
    let mut buckets: Vec<Vec<OpenCluster>> = Vec::new();

    for track in rows {
        let Some((format, size, duration)) = cluster_key(&track) else {
            continue;
        };
        let index = *bucket_index.entry((format, size)).or_insert_with(|| {
            buckets.push(Vec::new());
            buckets.len() - 1
        });
        let clusters = &mut buckets[index];

        let mut pending = Some(track);
        for cluster in clusters.iter_mut() {
            let Some(track) = pending.take() else {
                break;
            };
            if let Err(rejected) = cluster.try_admit(track, duration) {
                pending = Some(rejected);
            }
        }
        if let Some(track) = pending {
            clusters.push(OpenCluster::new(track, duration));
        }
    }

    buckets
        .into_iter()
        .flatten()
        .filter(|cluster| cluster.members.len() > 1)
        .map(|cluster| cluster.members)
        .collect()
}
