//! Removal of tracks that carry no real-world usage data.
//!
//! Debug recordings, uploads from the staging backend, and rides recorded
//! with one of the app's simulated positioning modes are deleted.

use rusqlite::{params, ToSql};
use serde::Serialize;

use crate::database::Database;
use crate::error::HubResult;

/// Positioning modes that replay or simulate a ride instead of recording one
pub const SYNTHETIC_POSITIONING_MODES: [&str; 7] = [
    "follow18kmh",
    "follow40kmh",
    "recordedDresden",
    "recordedHamburg",
    "hamburgStatic1",
    "dresdenStatic1",
    "dresdenStatic2",
];

pub const STAGING_BACKEND: &str = "staging";

/// Tracks removed, by the first reason that matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub debug: usize,
    pub staging: usize,
    pub positioning_mode: usize,
}

impl CleanupSummary {
    pub fn total(&self) -> usize {
        self.debug + self.staging + self.positioning_mode
    }
}

/// Delete debug, staging and synthetic-positioning tracks in one transaction
pub fn clean_up_tracks(db: &Database) -> HubResult<CleanupSummary> {
    let before = db.counts()?.tracks;
    tracing::info!("Starting clean up of tracks ({} stored)", before);

    let tx = db.connection().unchecked_transaction()?;

    let debug = db.delete_tracks_where("debug = 1", &[])?;
    let staging = db.delete_tracks_where("backend = ?", params![STAGING_BACKEND])?;

    let placeholders = vec!["?"; SYNTHETIC_POSITIONING_MODES.len()].join(", ");
    let modes: Vec<&dyn ToSql> = SYNTHETIC_POSITIONING_MODES
        .iter()
        .map(|mode| mode as &dyn ToSql)
        .collect();
    let positioning_mode = db.delete_tracks_where(
        &format!("positioning_mode IN ({})", placeholders),
        &modes,
    )?;

    tx.commit()?;

    let summary = CleanupSummary {
        debug,
        staging,
        positioning_mode,
    };
    tracing::info!(
        "Cleaned up {} tracks ({} debug, {} staging backend, {} positioning mode), {} remain",
        summary.total(),
        summary.debug,
        summary.staging,
        summary.positioning_mode,
        before - summary.total() as i64
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Track;

    fn track(session: &str, debug: bool, backend: &str, mode: &str) -> Track {
        let mut track = Track::new(session, 0, Some(1_000));
        track.debug = debug;
        track.backend = backend.to_string();
        track.positioning_mode = mode.to_string();
        track
    }

    #[test]
    fn test_clean_up_counts_by_first_reason() {
        let db = Database::new_in_memory().unwrap();
        db.insert_track(&track("keep", false, "production", "gps")).unwrap();
        db.insert_track(&track("dbg", true, "staging", "follow18kmh")).unwrap();
        db.insert_track(&track("stg", false, "staging", "gps")).unwrap();
        db.insert_track(&track("sim1", false, "production", "recordedDresden")).unwrap();
        db.insert_track(&track("sim2", false, "production", "dresdenStatic2")).unwrap();

        let summary = clean_up_tracks(&db).unwrap();

        assert_eq!(
            summary,
            CleanupSummary {
                debug: 1,
                staging: 1,
                positioning_mode: 2,
            }
        );
        let remaining: Vec<String> = db
            .get_all_tracks()
            .unwrap()
            .into_iter()
            .map(|t| t.session_id)
            .collect();
        assert_eq!(remaining, vec!["keep".to_string()]);
    }

    #[test]
    fn test_clean_up_on_clean_store() {
        let db = Database::new_in_memory().unwrap();
        db.insert_track(&track("keep", false, "production", "gps")).unwrap();

        assert_eq!(clean_up_tracks(&db).unwrap().total(), 0);
        assert_eq!(db.counts().unwrap().tracks, 1);
    }
}
