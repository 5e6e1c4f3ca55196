//! Derived metrics, regenerated after a sync cycle brought in new data.
//!
//! The sync loop only decides *whether* to regenerate (`should_regenerate`);
//! what regeneration produces is up to the `MetricsSink` it was given.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::HubResult;
use crate::models::StoreCounts;

/// Answers from the automated test fleet carry this in their user id
pub const TEST_FLEET_MARKER: &str = "Biker-Swarm";

/// Question whose answers make up the app rating distribution
pub const APP_FEEDBACK_QUESTION: &str = "Dein Feedback zur App";

/// True when either table grew over the cycle
pub fn should_regenerate(before: &StoreCounts, after: &StoreCounts) -> bool {
    after.grew_since(before)
}

/// Recomputes derived metrics from the store
pub trait MetricsSink {
    fn regenerate(&self, db: &Database) -> HubResult<()>;
}

impl<T: MetricsSink + ?Sized> MetricsSink for Box<T> {
    fn regenerate(&self, db: &Database) -> HubResult<()> {
        (**self).regenerate(db)
    }
}

/// Sink for instances without a metrics file
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn regenerate(&self, _db: &Database) -> HubResult<()> {
        tracing::debug!("No metrics sink configured, skipping regeneration");
        Ok(())
    }
}

/// Writes a `MetricsSnapshot` as JSON to a file
#[derive(Debug, Clone)]
pub struct SnapshotMetrics {
    path: PathBuf,
}

impl SnapshotMetrics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetricsSink for SnapshotMetrics {
    fn regenerate(&self, db: &Database) -> HubResult<()> {
        let snapshot = MetricsSnapshot::compute(db)?;
        let content = serde_json::to_string_pretty(&snapshot)?;

        // Write then rename so readers never see a partial file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        tracing::info!(
            "Regenerated metrics ({} tracks, {} answers) at {}",
            snapshot.tracks.total(),
            snapshot.answers.total(),
            self.path.display()
        );
        Ok(())
    }
}

/// A value split by whether it stems from debug data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSplit<T> {
    pub debug: T,
    pub regular: T,
}

impl DebugSplit<i64> {
    pub fn total(&self) -> i64 {
        self.debug + self.regular
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub tracks: DebugSplit<i64>,
    /// Debug answers are those of the test fleet
    pub answers: DebugSplit<i64>,
    /// Time spent riding, over finished tracks only
    pub seconds_riding: DebugSplit<i64>,
    pub users: DebugSplit<i64>,
    pub tracks_by_device_type: DebugSplit<BTreeMap<String, i64>>,
    pub tracks_by_bike_type: BTreeMap<String, i64>,
    pub tracks_by_preference_type: BTreeMap<String, i64>,
    pub tracks_by_activity_type: BTreeMap<String, i64>,
    /// Latest app rating per user, counted by value
    pub ratings: BTreeMap<String, i64>,
}

impl MetricsSnapshot {
    pub fn compute(db: &Database) -> HubResult<Self> {
        let conn = db.connection();
        let marker = format!("%{}%", TEST_FLEET_MARKER);

        let tracks = split(conn, "SELECT COUNT(*) FROM tracks WHERE debug = ?1")?;
        let seconds_riding = split(
            conn,
            "SELECT COALESCE(SUM(end_time - start_time), 0) / 1000
             FROM tracks WHERE debug = ?1 AND end_time IS NOT NULL",
        )?;
        let users = split(
            conn,
            "SELECT COUNT(DISTINCT user_id) FROM tracks WHERE debug = ?1",
        )?;

        let answers_debug: i64 = conn.query_row(
            "SELECT COUNT(*) FROM answers WHERE user_id LIKE ?1",
            [&marker],
            |row| row.get(0),
        )?;
        let answers_total: i64 =
            conn.query_row("SELECT COUNT(*) FROM answers", [], |row| row.get(0))?;

        let tracks_by_device_type = DebugSplit {
            debug: grouped(
                conn,
                "SELECT device_type, COUNT(*) FROM tracks WHERE debug = 1 GROUP BY device_type",
                params![],
            )?,
            regular: grouped(
                conn,
                "SELECT device_type, COUNT(*) FROM tracks WHERE debug = 0 GROUP BY device_type",
                params![],
            )?,
        };

        let ratings = grouped(
            conn,
            "SELECT COALESCE(value, 'unknown'), COUNT(*) FROM (
                 SELECT value, ROW_NUMBER() OVER (
                     PARTITION BY user_id ORDER BY created_at DESC, rowid DESC
                 ) AS rn
                 FROM answers WHERE question_text = ?1
             ) WHERE rn = 1 GROUP BY 1",
            params![APP_FEEDBACK_QUESTION],
        )?;

        Ok(Self {
            generated_at: Utc::now().trunc_subsecs(0),
            tracks,
            answers: DebugSplit {
                debug: answers_debug,
                regular: answers_total - answers_debug,
            },
            seconds_riding,
            users,
            tracks_by_device_type,
            tracks_by_bike_type: grouped(
                conn,
                "SELECT bike_type, COUNT(*) FROM tracks GROUP BY bike_type",
                params![],
            )?,
            tracks_by_preference_type: grouped(
                conn,
                "SELECT preference_type, COUNT(*) FROM tracks GROUP BY preference_type",
                params![],
            )?,
            tracks_by_activity_type: grouped(
                conn,
                "SELECT activity_type, COUNT(*) FROM tracks GROUP BY activity_type",
                params![],
            )?,
            ratings,
        })
    }
}

/// Run a single-value aggregate once per debug flag
fn split(conn: &Connection, sql: &str) -> HubResult<DebugSplit<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let debug = stmt.query_row([true], |row| row.get(0))?;
    let regular = stmt.query_row([false], |row| row.get(0))?;
    Ok(DebugSplit { debug, regular })
}

fn grouped(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> HubResult<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}
