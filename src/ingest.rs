//! Upload endpoints used by the mobile app.
//!
//! - POST /tracks/post/ - Store a recorded track
//! - POST /answers/post/ - Store (or replace) the survey answer of a session
//!
//! Both are only mounted on workers. The raw track body is kept as metadata.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;

use crate::database::lock_database;
use crate::error::HubError;
use crate::models::{Answer, Track, MAX_QUESTION_IMAGE_LENGTH, UNKNOWN};
use crate::sync_server::{bad_request, AppState};

const ANONYMOUS_USER: &str = "anonymous";

/// Room for the question image plus the answer's other fields
pub const MAX_ANSWER_BODY_BYTES: usize = MAX_QUESTION_IMAGE_LENGTH + 1024 * 1024;

/// Tracks carry up to four raw sensor CSV recordings of a whole ride
pub const MAX_TRACK_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

fn success() -> Response {
    Json(SuccessResponse { success: true }).into_response()
}

fn missing(field: &str) -> Response {
    bad_request(&format!("Missing {}.", field))
}

/// Non-empty string at `key`, if any
fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn label(object: &Value, key: &str) -> String {
    str_field(object, key).unwrap_or(UNKNOWN).to_string()
}

fn csv(object: &Value, key: &str) -> Option<String> {
    str_field(object, key).map(str::to_string)
}

/// Unix milliseconds at `key`. Whole-number floats such as `1.7e12` count.
fn millis(object: &Value, key: &str) -> Result<i64, Response> {
    let value = match object.get(key) {
        None | Some(Value::Null) => return Err(missing(key)),
        Some(value) => value,
    };
    value
        .as_i64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        })
        .ok_or_else(|| bad_request(&format!("Invalid {}.", key)))
}

/// Build a track from the app's upload body, or the 400 to send back
fn parse_track(json: Value) -> Result<Track, Response> {
    let start_time = millis(&json, "startTime")?;
    let end_time = millis(&json, "endTime")?;
    let debug = json
        .get("debug")
        .and_then(Value::as_bool)
        .ok_or_else(|| missing("debug"))?;

    let settings = json
        .get("settings")
        .filter(|v| v.is_object())
        .ok_or_else(|| missing("settings"))?;
    let backend = str_field(settings, "backend").ok_or_else(|| missing("backend"))?;
    let positioning_mode =
        str_field(settings, "positioningMode").ok_or_else(|| missing("positioningMode"))?;

    let device_info = json
        .get("deviceInfo")
        .filter(|v| v.is_object())
        .ok_or_else(|| missing("deviceInfo"))?;
    let device_type = str_field(device_info, "name").ok_or_else(|| missing("deviceInfo.name"))?;
    let device_id = str_field(device_info, "androidId")
        .or_else(|| str_field(device_info, "identifierForVendor"))
        .ok_or_else(|| missing("deviceInfo.androidId or deviceInfo.identifierForVendor"))?;

    let session_id = str_field(&json, "sessionId").ok_or_else(|| missing("sessionId"))?;

    let mut track = Track::new(session_id, start_time, Some(end_time));
    track.debug = debug;
    track.backend = backend.to_string();
    track.positioning_mode = positioning_mode.to_string();
    track.device_type = device_type.to_string();
    // The device id stands in for the user when the app sends none
    track.user_id = str_field(&json, "userId").unwrap_or(device_id).to_string();
    track.bike_type = label(&json, "bikeType");
    track.preference_type = label(&json, "preferenceType");
    track.activity_type = label(&json, "activityType");
    track.can_battery_analysis = json.get("canBatteryAnalysis").and_then(Value::as_bool);
    track.avg_battery_consumption = json.get("avgBatteryConsumption").and_then(Value::as_f64);
    track.gps_csv = csv(&json, "gpsCSV");
    track.accelerometer_csv = csv(&json, "accelerometerCSV");
    track.gyroscope_csv = csv(&json, "gyroscopeCSV");
    track.magnetometer_csv = csv(&json, "magnetometerCSV");
    track.metadata = json;
    Ok(track)
}

fn parse_answer(json: &Value) -> Result<Answer, Response> {
    let question_text =
        str_field(json, "questionText").ok_or_else(|| missing("questionText"))?;
    let session_id = str_field(json, "sessionId").ok_or_else(|| missing("sessionId"))?;
    let user_id = str_field(json, "userId").unwrap_or(ANONYMOUS_USER);

    let mut answer = Answer::new(session_id, user_id, question_text);
    answer.question_image = json
        .get("questionImage")
        .and_then(Value::as_str)
        .map(str::to_string);
    answer.value = json.get("value").and_then(|v| match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    });
    Ok(answer)
}

async fn post_track(State(state): State<AppState>, body: Bytes) -> Response {
    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(_) => return bad_request("Invalid request."),
    };
    let track = match parse_track(json) {
        Ok(track) => track,
        Err(response) => return response,
    };

    match lock_database(&state.db).and_then(|db| db.insert_track(&track)) {
        Ok(id) => {
            tracing::debug!("Stored track {} (session {})", id, track.session_id);
            success()
        }
        Err(HubError::Conflict(message)) => {
            tracing::warn!("{}", message);
            bad_request("Track already exists.")
        }
        Err(e) => {
            tracing::warn!("Rejected track upload: {}", e);
            bad_request("Invalid request.")
        }
    }
}

async fn post_answer(State(state): State<AppState>, body: Bytes) -> Response {
    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(_) => return bad_request("Invalid request."),
    };
    let answer = match parse_answer(&json) {
        Ok(answer) => answer,
        Err(response) => return response,
    };

    match lock_database(&state.db).and_then(|db| db.upsert_answer(&answer)) {
        Ok(()) => {
            tracing::debug!("Stored answer for session {}", answer.session_id);
            success()
        }
        Err(e) => {
            tracing::warn!("Rejected answer upload: {}", e);
            bad_request("Invalid request.")
        }
    }
}

/// Upload routes, merged into the worker router
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/tracks/post/",
            post(post_track).layer(DefaultBodyLimit::max(MAX_TRACK_BODY_BYTES)),
        )
        .route(
            "/answers/post/",
            post(post_answer).layer(DefaultBodyLimit::max(MAX_ANSWER_BODY_BYTES)),
        )
}
