//! SQLite storage for the track table and the fingerprint cache.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::protocol::{Candidate, FingerprintStatus, TrackRecord};

const DB_FILENAME: &str = "songsearch.db";

const TRACK_COLUMNS: &str = "id, path, format, duration, file_size, bitrate, samplerate, \
     channels, mtime, title, artist, album, album_artist, year, track_no, disc_no, genre, \
     fp_status, acoustid_id, mb_recording_id, mb_release_id, mb_release_group_id, \
     mb_confidence, cover_art_url, missing";

// Columns added after the first schema revision, in the order they shipped.
const MIGRATION_COLUMNS: &[(&str, &str)] = &[
    ("album_artist", "TEXT"),
    ("track_no", "INTEGER"),
    ("disc_no", "INTEGER"),
    ("fp_status", "TEXT"),
    ("acoustid_id", "TEXT"),
    ("mb_recording_id", "TEXT"),
    ("mb_release_id", "TEXT"),
    ("mb_release_group_id", "TEXT"),
    ("mb_confidence", "REAL"),
    ("cover_art_url", "TEXT"),
];

/// Raw fingerprint cache hit, before the payload is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintCacheRow {
    pub payload: String,
    pub confidence: f64,
}

pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    /// Default database location under the platform data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("songsearch").join(DB_FILENAME))
    }

    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        db_manager.migrate()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY,
                path TEXT UNIQUE NOT NULL,
                title TEXT,
                artist TEXT,
                album TEXT,
                year INTEGER,
                genre TEXT,
                duration REAL,
                bitrate INTEGER,
                samplerate INTEGER,
                channels INTEGER,
                format TEXT,
                mtime REAL,
                file_size INTEGER,
                missing INTEGER DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS fingerprint_cache (
                path TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL,
                file_size INTEGER NOT NULL,
                payload TEXT NOT NULL,
                confidence REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(tracks)")?;
        let existing = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;

        for (column, column_type) in MIGRATION_COLUMNS {
            if !existing.iter().any(|name| name == column) {
                self.conn.execute(
                    &format!("ALTER TABLE tracks ADD COLUMN {column} {column_type}"),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn row_to_track(row: &Row<'_>) -> Result<TrackRecord, rusqlite::Error> {
        let status: Option<String> = row.get(17)?;
        Ok(TrackRecord {
            id: row.get(0)?,
            path: row.get(1)?,
            format: row.get(2)?,
            duration: row.get(3)?,
            file_size: row.get(4)?,
            bitrate: row.get(5)?,
            samplerate: row.get(6)?,
            channels: row.get(7)?,
            mtime: row.get(8)?,
            title: row.get(9)?,
            artist: row.get(10)?,
            album: row.get(11)?,
            album_artist: row.get(12)?,
            year: row
                .get::<_, Option<i64>>(13)?
                .and_then(|value| i32::try_from(value).ok()),
            track_no: row
                .get::<_, Option<i64>>(14)?
                .and_then(|value| u32::try_from(value).ok()),
            disc_no: row
                .get::<_, Option<i64>>(15)?
                .and_then(|value| u32::try_from(value).ok()),
            genre: row.get(16)?,
            fingerprint_status: FingerprintStatus::from_column_value(status.as_deref()),
            acoustid_id: row.get(18)?,
            mb_recording_id: row.get(19)?,
            mb_release_id: row.get(20)?,
            mb_release_group_id: row.get(21)?,
            confidence: row.get(22)?,
            cover_art_url: row.get(23)?,
            missing: row.get::<_, Option<i64>>(24)?.unwrap_or(0) != 0,
        })
    }

    fn query_tracks(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<TrackRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(sql)?;
        let track_iter = stmt.query_map(params, Self::row_to_track)?;

        let mut tracks = Vec::new();
        for track in track_iter {
            tracks.push(track?);
        }
        Ok(tracks)
    }

    /// Inserts or refreshes a track row keyed by path, returning its row id.
    pub fn upsert_track(&self, track: &TrackRecord) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO tracks (
                path, format, duration, file_size, bitrate, samplerate, channels, mtime,
                title, artist, album, album_artist, year, track_no, disc_no, genre,
                fp_status, acoustid_id, mb_recording_id, mb_release_id, mb_release_group_id,
                mb_confidence, cover_art_url, missing
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            ON CONFLICT(path) DO UPDATE SET
                format = excluded.format,
                duration = excluded.duration,
                file_size = excluded.file_size,
                bitrate = excluded.bitrate,
                samplerate = excluded.samplerate,
                channels = excluded.channels,
                mtime = excluded.mtime,
                title = excluded.title,
                artist = excluded.artist,
                album = excluded.album,
                album_artist = excluded.album_artist,
                year = excluded.year,
                track_no = excluded.track_no,
                disc_no = excluded.disc_no,
                genre = excluded.genre,
                fp_status = excluded.fp_status,
                acoustid_id = excluded.acoustid_id,
                mb_recording_id = excluded.mb_recording_id,
                mb_release_id = excluded.mb_release_id,
                mb_release_group_id = excluded.mb_release_group_id,
                mb_confidence = excluded.mb_confidence,
                cover_art_url = excluded.cover_art_url,
                missing = excluded.missing",
            params![
                track.path,
                track.format,
                track.duration,
                track.file_size,
                track.bitrate,
                track.samplerate,
                track.channels,
                track.mtime,
                track.title,
                track.artist,
                track.album,
                track.album_artist,
                track.year,
                track.track_no,
                track.disc_no,
                track.genre,
                track.fingerprint_status.as_column_value(),
                track.acoustid_id,
                track.mb_recording_id,
                track.mb_release_id,
                track.mb_release_group_id,
                track.confidence,
                track.cover_art_url,
                track.missing as i64,
            ],
        )?;
        self.conn.query_row(
            "SELECT id FROM tracks WHERE path = ?1",
            params![track.path],
            |row| row.get(0),
        )
    }

    pub fn get_by_path(&self, path: &str) -> Result<Option<TrackRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE path = ?1"),
                params![path],
                Self::row_to_track,
            )
            .optional()
    }

    pub fn set_fingerprint_status(
        &self,
        path: &str,
        status: FingerprintStatus,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE tracks SET fp_status = ?1 WHERE path = ?2",
            params![status.as_column_value(), path],
        )?;
        Ok(())
    }

    pub fn mark_missing(&self, path: &str) -> Result<(), rusqlite::Error> {
        self.conn
            .execute("UPDATE tracks SET missing = 1 WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Writes every candidate field onto the track and marks it done.
    pub fn apply_candidate(&self, path: &str, candidate: &Candidate) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE tracks SET
                title = ?1, artist = ?2, album = ?3, album_artist = ?4, year = ?5,
                track_no = ?6, disc_no = ?7, fp_status = ?8, acoustid_id = ?9,
                mb_recording_id = ?10, mb_release_id = ?11, mb_release_group_id = ?12,
                mb_confidence = ?13, cover_art_url = ?14
             WHERE path = ?15",
            params![
                candidate.title,
                candidate.artist,
                candidate.album,
                candidate.album_artist,
                candidate.year,
                candidate.track_no,
                candidate.disc_no,
                FingerprintStatus::Done.as_column_value(),
                candidate.acoustid_id,
                candidate.recording_id,
                candidate.release_id,
                candidate.release_group_id,
                candidate.confidence,
                candidate.cover_art_url,
                path,
            ],
        )?;
        Ok(())
    }

    /// Present tracks missing artist, title, album, or year, newest rows first.
    pub fn tracks_needing_enrichment(
        &self,
        limit: usize,
    ) -> Result<Vec<TrackRecord>, rusqlite::Error> {
        self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM tracks
                 WHERE (artist IS NULL OR TRIM(artist) = ''
                        OR title IS NULL OR TRIM(title) = ''
                        OR album IS NULL OR TRIM(album) = ''
                        OR year IS NULL)
                   AND COALESCE(missing, 0) = 0
                 ORDER BY id DESC
                 LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Present tracks carrying everything duplicate clustering needs.
    pub fn duplicate_scan_rows(&self) -> Result<Vec<TrackRecord>, rusqlite::Error> {
        self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM tracks
                 WHERE duration IS NOT NULL
                   AND file_size IS NOT NULL
                   AND format IS NOT NULL
                   AND COALESCE(missing, 0) = 0
                 ORDER BY id ASC"
            ),
            [],
        )
    }

    /// Points a track (and its fingerprint cache entry) at a new location.
    pub fn relocate_track(&self, old_path: &str, new_path: &str) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE tracks SET path = ?1 WHERE path = ?2",
            params![new_path, old_path],
        )?;
        tx.execute(
            "DELETE FROM fingerprint_cache WHERE path = ?1",
            params![new_path],
        )?;
        tx.execute(
            "UPDATE fingerprint_cache SET path = ?1 WHERE path = ?2",
            params![new_path, old_path],
        )?;
        tx.commit()
    }

    /// Returns the cached payload only when the stored key matches exactly.
    pub fn get_fingerprint_cache(
        &self,
        path: &str,
        mtime_secs: i64,
        file_size: i64,
    ) -> Result<Option<FingerprintCacheRow>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT payload, confidence FROM fingerprint_cache
                 WHERE path = ?1 AND mtime = ?2 AND file_size = ?3",
                params![path, mtime_secs, file_size],
                |row| {
                    Ok(FingerprintCacheRow {
                        payload: row.get(0)?,
                        confidence: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    pub fn upsert_fingerprint_cache(
        &self,
        path: &str,
        mtime_secs: i64,
        file_size: i64,
        payload: &str,
        confidence: f64,
        updated_at_unix_ms: i64,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO fingerprint_cache (path, mtime, file_size, payload, confidence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime,
                file_size = excluded.file_size,
                payload = excluded.payload,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
            params![path, mtime_secs, file_size, payload, confidence, updated_at_unix_ms],
        )?;
        Ok(())
    }
}
