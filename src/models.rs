//! Data models for trackhub.
//!
//! This module defines the stored entities (Track, Answer) and the wire
//! document a worker hands to the manager during sync. The stored schema is
//! fixed; `ExportDocument` is the adapter between it and the wire format, so
//! older documents that predate a field still load with that field defaulted.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Current version of the export document written by this build.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Placeholder used by the mobile app for labels it could not determine.
pub const UNKNOWN: &str = "unknown";

// Limits (matching the mobile app's upload contract)
pub const MAX_LABEL_LENGTH: usize = 255;
pub const MAX_USER_ID_LENGTH: usize = 100;
pub const MAX_QUESTION_TEXT_LENGTH: usize = 300;
pub const MAX_ANSWER_VALUE_LENGTH: usize = 1_000;
pub const MAX_QUESTION_IMAGE_LENGTH: usize = 10_000_000;

/// A recorded GPS/sensor session uploaded by the app.
///
/// Times are unix milliseconds as reported by the device. `created_at` is
/// when the backend received the track and is accurate to the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Store-local sequence number (None until inserted)
    pub id: Option<i64>,
    /// Session identifier, unique across the store
    pub session_id: String,
    pub start_time: i64,
    /// None while in progress or if the app terminated early
    pub end_time: Option<i64>,
    pub debug: bool,
    pub backend: String,
    pub positioning_mode: String,
    pub user_id: String,
    pub device_type: String,
    pub bike_type: String,
    pub preference_type: String,
    pub activity_type: String,
    pub can_battery_analysis: Option<bool>,
    pub avg_battery_consumption: Option<f64>,
    pub created_at: DateTime<Utc>,
    /// The raw JSON the app posted
    pub metadata: serde_json::Value,
    pub gps_csv: Option<String>,
    pub accelerometer_csv: Option<String>,
    pub gyroscope_csv: Option<String>,
    pub magnetometer_csv: Option<String>,
}

impl Track {
    /// Create a track with all labels set to "unknown"
    pub fn new(session_id: impl Into<String>, start_time: i64, end_time: Option<i64>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            start_time,
            end_time,
            debug: false,
            backend: UNKNOWN.to_string(),
            positioning_mode: UNKNOWN.to_string(),
            user_id: UNKNOWN.to_string(),
            device_type: UNKNOWN.to_string(),
            bike_type: UNKNOWN.to_string(),
            preference_type: UNKNOWN.to_string(),
            activity_type: UNKNOWN.to_string(),
            can_battery_analysis: None,
            avg_battery_consumption: None,
            created_at: Utc::now().trunc_subsecs(0),
            metadata: serde_json::Value::Null,
            gps_csv: None,
            accelerometer_csv: None,
            gyroscope_csv: None,
            magnetometer_csv: None,
        }
    }

    /// Duration in milliseconds, if the track was finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Check the invariants the store relies on
    pub fn validate(&self) -> HubResult<()> {
        validate_session_id(&self.session_id)?;
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(HubError::validation(
                    "end_time",
                    format!(
                        "end_time {} precedes start_time {} (session {})",
                        end, self.start_time, self.session_id
                    ),
                ));
            }
        }
        for (field, value) in [
            ("backend", &self.backend),
            ("positioning_mode", &self.positioning_mode),
            ("user_id", &self.user_id),
            ("device_type", &self.device_type),
            ("bike_type", &self.bike_type),
            ("preference_type", &self.preference_type),
            ("activity_type", &self.activity_type),
        ] {
            validate_max_len(field, value, MAX_LABEL_LENGTH)?;
        }
        Ok(())
    }
}

/// A response to an in-app survey question.
///
/// One answer per session: the session id is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub session_id: String,
    pub user_id: String,
    pub question_text: String,
    /// Base64 encoded image shown with the question
    pub question_image: Option<String>,
    /// Likert value, yes/no, or free text
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Answer {
    /// Create a new answer with no image and no value
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        question_text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            question_text: question_text.into(),
            question_image: None,
            value: None,
            created_at: Utc::now().trunc_subsecs(0),
        }
    }

    pub fn validate(&self) -> HubResult<()> {
        validate_session_id(&self.session_id)?;
        validate_max_len("user_id", &self.user_id, MAX_USER_ID_LENGTH)?;
        if self.question_text.is_empty() {
            return Err(HubError::validation("question_text", "must not be empty"));
        }
        validate_max_len(
            "question_text",
            &self.question_text,
            MAX_QUESTION_TEXT_LENGTH,
        )?;
        if let Some(image) = &self.question_image {
            validate_max_len("question_image", image, MAX_QUESTION_IMAGE_LENGTH)?;
        }
        if let Some(value) = &self.value {
            validate_max_len("value", value, MAX_ANSWER_VALUE_LENGTH)?;
        }
        Ok(())
    }
}

fn validate_session_id(session_id: &str) -> HubResult<()> {
    if session_id.trim().is_empty() {
        return Err(HubError::validation("session_id", "must not be empty"));
    }
    validate_max_len("session_id", session_id, MAX_LABEL_LENGTH)
}

fn validate_max_len(field: &str, value: &str, max: usize) -> HubResult<()> {
    let len = value.chars().count();
    if len > max {
        return Err(HubError::validation(
            field,
            format!("must be at most {} characters, got {}", max, len),
        ));
    }
    Ok(())
}

/// Row counts of the two entity tables at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub tracks: i64,
    pub answers: i64,
}

impl StoreCounts {
    pub fn total(&self) -> i64 {
        self.tracks + self.answers
    }

    /// True if either table grew relative to `before`
    pub fn grew_since(&self, before: &StoreCounts) -> bool {
        self.tracks > before.tracks || self.answers > before.answers
    }
}

// ============================================================================
// Wire format
// ============================================================================

fn default_unknown() -> String {
    UNKNOWN.to_string()
}

/// A track as it travels between worker and manager.
///
/// The store-local sequence number is deliberately absent: every store
/// numbers its own rows, identity across stores is the session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub session_id: String,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_unknown")]
    pub backend: String,
    #[serde(default = "default_unknown")]
    pub positioning_mode: String,
    #[serde(default = "default_unknown")]
    pub user_id: String,
    #[serde(default = "default_unknown")]
    pub device_type: String,
    #[serde(default = "default_unknown")]
    pub bike_type: String,
    #[serde(default = "default_unknown")]
    pub preference_type: String,
    #[serde(default = "default_unknown")]
    pub activity_type: String,
    #[serde(default)]
    pub can_battery_analysis: Option<bool>,
    #[serde(default)]
    pub avg_battery_consumption: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub gps_csv: Option<String>,
    #[serde(default)]
    pub accelerometer_csv: Option<String>,
    #[serde(default)]
    pub gyroscope_csv: Option<String>,
    #[serde(default)]
    pub magnetometer_csv: Option<String>,
}

impl From<&Track> for TrackRecord {
    fn from(track: &Track) -> Self {
        Self {
            session_id: track.session_id.clone(),
            start_time: track.start_time,
            end_time: track.end_time,
            debug: track.debug,
            backend: track.backend.clone(),
            positioning_mode: track.positioning_mode.clone(),
            user_id: track.user_id.clone(),
            device_type: track.device_type.clone(),
            bike_type: track.bike_type.clone(),
            preference_type: track.preference_type.clone(),
            activity_type: track.activity_type.clone(),
            can_battery_analysis: track.can_battery_analysis,
            avg_battery_consumption: track.avg_battery_consumption,
            created_at: track.created_at,
            metadata: track.metadata.clone(),
            gps_csv: track.gps_csv.clone(),
            accelerometer_csv: track.accelerometer_csv.clone(),
            gyroscope_csv: track.gyroscope_csv.clone(),
            magnetometer_csv: track.magnetometer_csv.clone(),
        }
    }
}

impl From<TrackRecord> for Track {
    fn from(record: TrackRecord) -> Self {
        Self {
            id: None,
            session_id: record.session_id,
            start_time: record.start_time,
            end_time: record.end_time,
            debug: record.debug,
            backend: record.backend,
            positioning_mode: record.positioning_mode,
            user_id: record.user_id,
            device_type: record.device_type,
            bike_type: record.bike_type,
            preference_type: record.preference_type,
            activity_type: record.activity_type,
            can_battery_analysis: record.can_battery_analysis,
            avg_battery_consumption: record.avg_battery_consumption,
            created_at: record.created_at,
            metadata: record.metadata,
            gps_csv: record.gps_csv,
            accelerometer_csv: record.accelerometer_csv,
            gyroscope_csv: record.gyroscope_csv,
            magnetometer_csv: record.magnetometer_csv,
        }
    }
}

/// Full dump of a worker's store, as served by `GET /sync/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub format_version: u32,
    /// Unix seconds at which the dump was taken
    pub exported_at: i64,
    #[serde(default)]
    pub tracks: Vec<TrackRecord>,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

impl ExportDocument {
    pub fn new(tracks: &[Track], answers: Vec<Answer>) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now().timestamp(),
            tracks: tracks.iter().map(TrackRecord::from).collect(),
            answers,
        }
    }

    /// Parse a document received from a worker.
    ///
    /// Fails on malformed JSON and on documents written by an incompatible
    /// format version.
    pub fn from_json(body: &str) -> HubResult<Self> {
        let document: ExportDocument = serde_json::from_str(body)?;
        if document.format_version != EXPORT_FORMAT_VERSION {
            return Err(HubError::sync(format!(
                "Unsupported export format version {} (expected {})",
                document.format_version, EXPORT_FORMAT_VERSION
            )));
        }
        Ok(document)
    }

    /// Convert to stored entities, validating every record.
    ///
    /// A single invalid record rejects the whole document.
    pub fn into_entities(self) -> HubResult<(Vec<Track>, Vec<Answer>)> {
        let tracks: Vec<Track> = self.tracks.into_iter().map(Track::from).collect();
        for track in &tracks {
            track.validate()?;
        }
        for answer in &self.answers {
            answer.validate()?;
        }
        Ok((tracks, self.answers))
    }
}
