//! Database operations for trackhub.
//!
//! This module provides all data access functionality using SQLite.
//!
//! Tracks carry a store-local `id` sequence for ordering plus a unique
//! `session_id`; answers are keyed by `session_id`. Timestamps on disk are
//! unix seconds (`created_at`) or unix milliseconds (`start_time`,
//! `end_time`, as reported by the device).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::models::{Answer, ExportDocument, StoreCounts, Track};

/// Schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

/// How long a writer waits on a lock held by a concurrent connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TRACK_COLUMNS: &str = "session_id, start_time, end_time, debug, backend, \
    positioning_mode, user_id, device_type, bike_type, preference_type, activity_type, \
    can_battery_analysis, avg_battery_consumption, created_at, metadata, gps_csv, \
    accelerometer_csv, gyroscope_csv, magnetometer_csv";

const TRACK_PLACEHOLDERS: &str = "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?";

const ANSWER_COLUMNS: &str = "session_id, user_id, question_text, question_image, value, created_at";

/// Outcome of merging an export document into the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub tracks_inserted: usize,
    /// Tracks whose session id already existed (existing row kept)
    pub tracks_ignored: usize,
    pub answers_inserted: usize,
    pub answers_ignored: usize,
}

impl MergeSummary {
    pub fn inserted(&self) -> usize {
        self.tracks_inserted + self.answers_inserted
    }
}

/// Rows removed by a delete-all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub tracks: usize,
    pub answers: usize,
}

/// Database handle shared between HTTP handlers and the sync loop
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Wrap a database for sharing
pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Lock a shared database, turning a poisoned lock into an error
pub fn lock_database(db: &SharedDatabase) -> HubResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| HubError::Other("Database lock poisoned".to_string()))
}

/// Convert stored unix seconds to a UTC datetime
fn timestamp_to_datetime(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> HubResult<Self> {
        let conn = Connection::open(db_path)?;

        // WAL lets ingestion keep writing while the sync loop reads/merges
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> HubResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> HubResult<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            return Err(HubError::config(format!(
                "Database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                debug INTEGER NOT NULL DEFAULT 0,
                backend TEXT NOT NULL DEFAULT 'unknown',
                positioning_mode TEXT NOT NULL DEFAULT 'unknown',
                user_id TEXT NOT NULL DEFAULT 'unknown',
                device_type TEXT NOT NULL DEFAULT 'unknown',
                bike_type TEXT NOT NULL DEFAULT 'unknown',
                preference_type TEXT NOT NULL DEFAULT 'unknown',
                activity_type TEXT NOT NULL DEFAULT 'unknown',
                can_battery_analysis INTEGER,
                avg_battery_consumption REAL,
                created_at INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                gps_csv TEXT,
                accelerometer_csv TEXT,
                gyroscope_csv TEXT,
                magnetometer_csv TEXT,
                CHECK (end_time IS NULL OR end_time >= start_time)
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_created_at ON tracks (created_at);
            CREATE INDEX IF NOT EXISTS idx_tracks_debug ON tracks (debug);

            CREATE TABLE IF NOT EXISTS answers (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                question_text TEXT NOT NULL,
                question_image TEXT,
                value TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        self.conn
            .execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        Ok(())
    }

    /// Get the underlying connection (for aggregate queries)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Insert a freshly ingested track and return its sequence number.
    ///
    /// A track whose session id already exists is rejected with
    /// `HubError::Conflict`; the stored row is left untouched.
    pub fn insert_track(&self, track: &Track) -> HubResult<i64> {
        track.validate()?;
        let sql = format!(
            "INSERT INTO tracks ({}) VALUES ({})",
            TRACK_COLUMNS, TRACK_PLACEHOLDERS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let metadata = serde_json::to_string(&track.metadata)?;

        match execute_track_insert(&mut stmt, track, &metadata) {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) => {
                let err = HubError::from(e);
                if err.is_constraint_violation() {
                    Err(HubError::Conflict(format!(
                        "Track with session {} already exists",
                        track.session_id
                    )))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Get a track by session id
    pub fn get_track(&self, session_id: &str) -> HubResult<Option<Track>> {
        let sql = format!(
            "SELECT id, {} FROM tracks WHERE session_id = ?",
            TRACK_COLUMNS
        );
        let track = self
            .conn
            .query_row(&sql, [session_id], row_to_track)
            .optional()?;
        Ok(track)
    }

    /// Get all tracks in insertion order
    pub fn get_all_tracks(&self) -> HubResult<Vec<Track>> {
        let sql = format!("SELECT id, {} FROM tracks ORDER BY id", TRACK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let tracks = stmt
            .query_map([], row_to_track)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Delete tracks matching a WHERE clause, returning the number removed
    pub(crate) fn delete_tracks_where(
        &self,
        condition: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> HubResult<usize> {
        let sql = format!("DELETE FROM tracks WHERE {}", condition);
        Ok(self.conn.execute(&sql, params)?)
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    /// Store an ingested answer, replacing any earlier answer of the session
    pub fn upsert_answer(&self, answer: &Answer) -> HubResult<()> {
        answer.validate()?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO answers ({}) VALUES (?, ?, ?, ?, ?, ?)",
                ANSWER_COLUMNS
            ),
            params![
                answer.session_id,
                answer.user_id,
                answer.question_text,
                answer.question_image,
                answer.value,
                answer.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Get an answer by session id
    pub fn get_answer(&self, session_id: &str) -> HubResult<Option<Answer>> {
        let sql = format!("SELECT {} FROM answers WHERE session_id = ?", ANSWER_COLUMNS);
        let answer = self
            .conn
            .query_row(&sql, [session_id], row_to_answer)
            .optional()?;
        Ok(answer)
    }

    /// Get all answers, oldest first
    pub fn get_all_answers(&self) -> HubResult<Vec<Answer>> {
        let sql = format!(
            "SELECT {} FROM answers ORDER BY created_at, session_id",
            ANSWER_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let answers = stmt
            .query_map([], row_to_answer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(answers)
    }

    // ------------------------------------------------------------------
    // Sync operations
    // ------------------------------------------------------------------

    /// Current row counts of both tables
    pub fn counts(&self) -> HubResult<StoreCounts> {
        let (tracks, answers) = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM tracks), (SELECT COUNT(*) FROM answers)",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(StoreCounts { tracks, answers })
    }

    /// Serialize every track and answer into one export document
    pub fn export_all(&self) -> HubResult<ExportDocument> {
        // Read both tables from one snapshot so a concurrent upload cannot
        // land between them
        let tx = self.conn.unchecked_transaction()?;
        let tracks = self.get_all_tracks()?;
        let answers = self.get_all_answers()?;
        tx.commit()?;
        Ok(ExportDocument::new(&tracks, answers))
    }

    /// Merge an export document with insert-or-ignore semantics.
    ///
    /// Every record is validated first; then all rows are inserted in one
    /// transaction. A row whose key already exists is skipped and the stored
    /// row wins, so merging the same document again changes nothing. On any
    /// error nothing is written.
    pub fn merge_export(&self, document: ExportDocument) -> HubResult<MergeSummary> {
        let (tracks, answers) = document.into_entities()?;
        let mut summary = MergeSummary::default();

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO tracks ({}) VALUES ({})",
                TRACK_COLUMNS, TRACK_PLACEHOLDERS
            ))?;
            for track in &tracks {
                let metadata = serde_json::to_string(&track.metadata)?;
                if execute_track_insert(&mut stmt, track, &metadata)? > 0 {
                    summary.tracks_inserted += 1;
                } else {
                    summary.tracks_ignored += 1;
                }
            }

            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO answers ({}) VALUES (?, ?, ?, ?, ?, ?)",
                ANSWER_COLUMNS
            ))?;
            for answer in &answers {
                let changed = stmt.execute(params![
                    answer.session_id,
                    answer.user_id,
                    answer.question_text,
                    answer.question_image,
                    answer.value,
                    answer.created_at.timestamp(),
                ])?;
                if changed > 0 {
                    summary.answers_inserted += 1;
                } else {
                    summary.answers_ignored += 1;
                }
            }
        }
        tx.commit()?;

        Ok(summary)
    }

    /// Delete every track and every answer in one transaction.
    ///
    /// Deleting from an empty store succeeds and reports zero rows.
    pub fn delete_all(&self) -> HubResult<DeleteSummary> {
        let tx = self.conn.unchecked_transaction()?;
        let tracks = tx.execute("DELETE FROM tracks", [])?;
        let answers = tx.execute("DELETE FROM answers", [])?;
        tx.commit()?;
        Ok(DeleteSummary { tracks, answers })
    }

    /// Delete every answer with no track of the same session id.
    ///
    /// A single statement, so an answer whose track is already committed is
    /// never removed, even with ingestion running on another connection.
    pub fn delete_orphan_answers(&self) -> HubResult<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM answers WHERE session_id NOT IN (SELECT session_id FROM tracks)",
            [],
        )?;
        Ok(deleted)
    }
}

fn execute_track_insert(
    stmt: &mut Statement<'_>,
    track: &Track,
    metadata: &str,
) -> rusqlite::Result<usize> {
    stmt.execute(params![
        track.session_id,
        track.start_time,
        track.end_time,
        track.debug,
        track.backend,
        track.positioning_mode,
        track.user_id,
        track.device_type,
        track.bike_type,
        track.preference_type,
        track.activity_type,
        track.can_battery_analysis,
        track.avg_battery_consumption,
        track.created_at.timestamp(),
        metadata,
        track.gps_csv,
        track.accelerometer_csv,
        track.gyroscope_csv,
        track.magnetometer_csv,
    ])
}

fn row_to_track(row: &Row) -> rusqlite::Result<Track> {
    let metadata: String = row.get(15)?;
    let metadata = serde_json::from_str(&metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(15, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Track {
        id: Some(row.get(0)?),
        session_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        debug: row.get(4)?,
        backend: row.get(5)?,
        positioning_mode: row.get(6)?,
        user_id: row.get(7)?,
        device_type: row.get(8)?,
        bike_type: row.get(9)?,
        preference_type: row.get(10)?,
        activity_type: row.get(11)?,
        can_battery_analysis: row.get(12)?,
        avg_battery_consumption: row.get(13)?,
        created_at: timestamp_to_datetime(14, row.get(14)?)?,
        metadata,
        gps_csv: row.get(16)?,
        accelerometer_csv: row.get(17)?,
        gyroscope_csv: row.get(18)?,
        magnetometer_csv: row.get(19)?,
    })
}

fn row_to_answer(row: &Row) -> rusqlite::Result<Answer> {
    Ok(Answer {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        question_text: row.get(2)?,
        question_image: row.get(3)?,
        value: row.get(4)?,
        created_at: timestamp_to_datetime(5, row.get(5)?)?,
    })
}
