//! HTTP server for trackhub using Axum.
//!
//! This module provides the worker side of the sync protocol:
//! - GET /sync/sync?key=... - Full export of tracks and answers
//! - DELETE /sync/sync - Delete everything (worker role only)
//! - /status - Role and row counts
//!
//! Which routes exist is decided once, from `ServerOptions`, when the router
//! is built. The sync and ingestion routes (see `ingest`) are mounted in
//! worker role only; a manager never serves its store.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::{Config, Role};
use crate::database::{lock_database, SharedDatabase};
use crate::error::{HubError, HubResult};
use crate::ingest;
use crate::sync_client::SYNC_PATH;

/// Route composition inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub role: Role,
    pub sync_key: String,
    /// Mount the sync endpoints (worker role only)
    pub sync_exposed: bool,
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            role: config.role(),
            sync_key: config.sync_key().to_string(),
            sync_exposed: config.is_sync_exposed(),
        }
    }
}

/// Shared server state
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) db: SharedDatabase,
    pub(crate) role: Role,
    sync_key: String,
}

impl AppState {
    /// An unset sync key authorizes nothing
    fn key_matches(&self, provided: Option<&str>) -> bool {
        !self.sync_key.is_empty() && provided == Some(self.sync_key.as_str())
    }
}

// Request/Response types

#[derive(Debug, Deserialize)]
struct ExportQuery {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    role: Role,
    tracks: i64,
    answers: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

/// 400 with `{"error": message}`
pub(crate) fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// Route handlers

async fn export_data(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Response {
    if !state.key_matches(query.key.as_deref()) {
        tracing::warn!("Export rejected: invalid key");
        return bad_request("Invalid key.");
    }

    let document = lock_database(&state.db).and_then(|db| db.export_all());
    match document {
        Ok(document) => {
            tracing::info!(
                "Exporting {} tracks and {} answers",
                document.tracks.len(),
                document.answers.len()
            );
            Json(document).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to export data: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Error during export.".to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn delete_data(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DeleteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            tracing::warn!("Delete rejected: invalid JSON");
            return bad_request("Invalid JSON.");
        }
    };

    if !state.role.is_worker() {
        tracing::warn!("Delete is disabled in non-worker mode");
        return bad_request("Delete is disabled in non-worker mode.");
    }

    if !state.key_matches(request.key.as_deref()) {
        tracing::warn!("Delete rejected: invalid key");
        return bad_request("Invalid key.");
    }

    match lock_database(&state.db).and_then(|db| db.delete_all()) {
        Ok(deleted) => {
            if deleted.tracks > 0 {
                tracing::info!("Deleted {} tracks as requested by manager", deleted.tracks);
            }
            if deleted.answers > 0 {
                tracing::info!("Deleted {} answers as requested by manager", deleted.answers);
            }
            Json(OkResponse {
                status: "ok".to_string(),
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!("Error during sync delete: {}", e);
            bad_request("Error during sync.")
        }
    }
}

async fn status(State(state): State<AppState>) -> Response {
    match lock_database(&state.db).and_then(|db| db.counts()) {
        Ok(counts) => Json(StatusResponse {
            role: state.role,
            tracks: counts.tracks,
            answers: counts.answers,
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to read counts: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Create the router for the given role
pub fn create_router(db: SharedDatabase, options: ServerOptions) -> Router {
    let state = AppState {
        db,
        role: options.role,
        sync_key: options.sync_key,
    };

    let mut router = Router::new().route("/status", get(status));

    if options.role.is_worker() {
        if options.sync_exposed {
            router = router.route(SYNC_PATH, get(export_data).delete(delete_data));
        }
        router = router.merge(ingest::routes());
    }

    router.with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(
    db: SharedDatabase,
    options: ServerOptions,
    port: u16,
    shutdown: F,
) -> HubResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let role = options.role;
    let router = create_router(db, options);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting {} server on {}", role, addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HubError::Network(e.to_string()))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HubError::Network(e.to_string()))?;

    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::database::{shared, Database};
    use crate::models::{Answer, ExportDocument, StoreCounts, Track};

    const KEY: &str = "s3cret";

    fn seeded_db() -> SharedDatabase {
        let db = Database::new_in_memory().unwrap();
        db.insert_track(&Track::new("s1", 0, Some(1_000))).unwrap();
        db.insert_track(&Track::new("s2", 0, None)).unwrap();
        db.upsert_answer(&Answer::new("s1", "user", "Dein Feedback zur App")).unwrap();
        shared(db)
    }

    fn worker_router(db: SharedDatabase) -> Router {
        create_router(
            db,
            ServerOptions {
                role: Role::Worker,
                sync_key: KEY.to_string(),
                sync_exposed: true,
            },
        )
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    fn export_request(key: Option<&str>) -> Request<Body> {
        let uri = match key {
            Some(key) => format!("{}?key={}", SYNC_PATH, key),
            None => SYNC_PATH.to_string(),
        };
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn delete_request(body: &str) -> Request<Body> {
        Request::delete(SYNC_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn counts(db: &SharedDatabase) -> StoreCounts {
        db.lock().unwrap().counts().unwrap()
    }

    #[tokio::test]
    async fn test_export_with_valid_key() {
        let db = seeded_db();
        let (status, body) = send(worker_router(db.clone()), export_request(Some(KEY))).await;

        assert_eq!(status, StatusCode::OK);
        let doc = ExportDocument::from_json(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(doc.tracks.len(), 2);
        assert_eq!(doc.answers.len(), 1);
        // Export has no side effects
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_export_with_wrong_or_missing_key() {
        let db = seeded_db();

        for request in [export_request(Some("nope")), export_request(None)] {
            let (status, body) = send(worker_router(db.clone()), request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json(&body), serde_json::json!({"error": "Invalid key."}));
        }
    }

    #[tokio::test]
    async fn test_unset_sync_key_authorizes_nothing() {
        let db = seeded_db();
        let router = create_router(
            db.clone(),
            ServerOptions {
                role: Role::Worker,
                sync_key: String::new(),
                sync_exposed: true,
            },
        );

        let (status, _) = send(router.clone(), export_request(Some(""))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(router, delete_request(r#"{"key": ""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_delete_all_twice() {
        let db = seeded_db();
        let body = format!(r#"{{"key": "{}"}}"#, KEY);

        let (status, response) = send(worker_router(db.clone()), delete_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&response), serde_json::json!({"status": "ok"}));
        assert_eq!(counts(&db), StoreCounts::default());

        let (status, response) = send(worker_router(db.clone()), delete_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&response), serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_delete_with_wrong_key_keeps_data() {
        let db = seeded_db();
        let (status, body) =
            send(worker_router(db.clone()), delete_request(r#"{"key": "nope"}"#)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body), serde_json::json!({"error": "Invalid key."}));
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_delete_with_invalid_json() {
        let db = seeded_db();
        let (status, body) = send(worker_router(db.clone()), delete_request("key=s3cret")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body), serde_json::json!({"error": "Invalid JSON."}));
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_manager_never_mounts_sync_routes() {
        let db = seeded_db();
        let router = create_router(
            db.clone(),
            ServerOptions {
                role: Role::Manager,
                sync_key: KEY.to_string(),
                sync_exposed: true,
            },
        );
        let body = format!(r#"{{"key": "{}"}}"#, KEY);

        let (status, _) = send(router.clone(), export_request(Some(KEY))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(router, delete_request(&body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_delete_handler_refuses_manager_role() {
        let db = seeded_db();
        let state = AppState {
            db: db.clone(),
            role: Role::Manager,
            sync_key: KEY.to_string(),
        };
        let body = format!(r#"{{"key": "{}"}}"#, KEY);

        let response = delete_data(State(state), Bytes::from(body)).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json(&bytes),
            serde_json::json!({"error": "Delete is disabled in non-worker mode."})
        );
        assert_eq!(counts(&db), StoreCounts { tracks: 2, answers: 1 });
    }

    #[tokio::test]
    async fn test_delete_storage_error() {
        let db = seeded_db();
        db.lock()
            .unwrap()
            .connection()
            .execute_batch("DROP TABLE answers;")
            .unwrap();
        let body = format!(r#"{{"key": "{}"}}"#, KEY);

        let (status, response) = send(worker_router(db.clone()), delete_request(&body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&response), serde_json::json!({"error": "Error during sync."}));
        // The failed transaction rolled back the track delete too
        let tracks: i64 = db
            .lock()
            .unwrap()
            .connection()
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tracks, 2);
    }

    #[tokio::test]
    async fn test_sync_routes_hidden_unless_exposed() {
        let db = seeded_db();
        let router = create_router(
            db,
            ServerOptions {
                role: Role::Worker,
                sync_key: KEY.to_string(),
                sync_exposed: false,
            },
        );
        let (status, _) = send(router, export_request(Some(KEY))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_reports_role_and_counts() {
        let db = seeded_db();
        let request = Request::get("/status").body(Body::empty()).unwrap();
        let (status, body) = send(worker_router(db), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({"role": "worker", "tracks": 2, "answers": 1})
        );
    }
}
