//! Sync client: the manager side of the worker sync protocol.
//!
//! For each worker the client:
//! - pulls the full export from `GET /sync/sync?key=...`
//! - merges it into the local store (insert-or-ignore, one transaction)
//! - only after the merge committed, tells the worker to delete everything
//!
//! A lost delete confirmation is harmless: the worker still holds the same
//! rows, the next pull merges them again and every one is ignored.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::database::{lock_database, MergeSummary, SharedDatabase};
use crate::error::{HubError, HubResult};
use crate::models::ExportDocument;

/// Path of the worker export/delete endpoint
pub const SYNC_PATH: &str = "/sync/sync";

/// Upper bound for each outbound request, so one hung worker cannot stall
/// the whole cycle
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a single worker sync ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Pulled, merged and deleted on the worker
    Synced,
    /// Connection failed; the worker is skipped this cycle
    Offline,
    /// Non-success status or empty body
    ExportFailed,
    /// Payload did not parse or could not be stored; no delete was issued
    MergeFailed,
    /// Data is merged but the worker did not confirm the delete
    DeleteFailed,
}

/// Result of syncing with one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSyncResult {
    pub worker: SocketAddr,
    pub outcome: WorkerOutcome,
    pub merged: MergeSummary,
    pub errors: Vec<String>,
}

impl WorkerSyncResult {
    fn failed(worker: SocketAddr, outcome: WorkerOutcome, error: impl Into<String>) -> Self {
        Self {
            worker,
            outcome,
            merged: MergeSummary::default(),
            errors: vec![error.into()],
        }
    }

    /// True if the worker's data reached the local store
    pub fn data_merged(&self) -> bool {
        matches!(
            self.outcome,
            WorkerOutcome::Synced | WorkerOutcome::DeleteFailed
        )
    }
}

/// Delete request body
#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    key: &'a str,
}

/// Source of the worker addresses to sync with in one cycle
pub trait WorkerDirectory {
    fn resolve(&self) -> impl Future<Output = HubResult<Vec<SocketAddr>>> + Send;
}

/// Resolves every address behind one hostname (e.g. a DNS round-robin or a
/// container service name).
#[derive(Debug, Clone)]
pub struct DnsWorkerDirectory {
    host: String,
    port: u16,
}

impl DnsWorkerDirectory {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl WorkerDirectory for DnsWorkerDirectory {
    fn resolve(&self) -> impl Future<Output = HubResult<Vec<SocketAddr>>> + Send {
        let host = self.host.clone();
        let port = self.port;
        async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| HubError::Network(format!("Failed to resolve {}: {}", host, e)))?;
            Ok(dedup_addresses(addrs))
        }
    }
}

/// A fixed list of workers
#[derive(Debug, Clone, Default)]
pub struct StaticWorkerDirectory {
    workers: Vec<SocketAddr>,
}

impl StaticWorkerDirectory {
    pub fn new(workers: Vec<SocketAddr>) -> Self {
        Self { workers }
    }
}

impl WorkerDirectory for StaticWorkerDirectory {
    fn resolve(&self) -> impl Future<Output = HubResult<Vec<SocketAddr>>> + Send {
        let workers = dedup_addresses(self.workers.clone());
        async move { Ok(workers) }
    }
}

/// Drop repeated addresses, keeping first-seen order
fn dedup_addresses(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    addrs.into_iter().filter(|addr| seen.insert(*addr)).collect()
}

/// Sync client
pub struct SyncClient {
    db: SharedDatabase,
    client: Client,
    sync_key: String,
}

impl SyncClient {
    /// Create a new sync client
    pub fn new(db: SharedDatabase, sync_key: impl Into<String>) -> HubResult<Self> {
        Self::with_timeout(db, sync_key, REQUEST_TIMEOUT)
    }

    /// Create a sync client with a custom per-request timeout
    pub fn with_timeout(
        db: SharedDatabase,
        sync_key: impl Into<String>,
        timeout: Duration,
    ) -> HubResult<Self> {
        let sync_key = sync_key.into();
        if sync_key.is_empty() {
            return Err(HubError::config("sync key must not be empty"));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HubError::Network(e.to_string()))?;

        Ok(Self {
            db,
            client,
            sync_key,
        })
    }

    /// The store merged data goes into
    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    /// Pull, merge and confirm-delete against one worker.
    ///
    /// Never fails as a whole: every problem is captured in the returned
    /// outcome so the caller can move on to the next worker.
    pub async fn sync_with_worker(&self, worker: SocketAddr) -> WorkerSyncResult {
        tracing::info!("Syncing with worker {}", worker);

        // Step 1: Pull the export
        let body = match self.fetch_export(worker).await {
            Ok(body) => body,
            Err(HubError::Network(e)) => {
                tracing::warn!("Worker {} seems offline: {}", worker, e);
                return WorkerSyncResult::failed(worker, WorkerOutcome::Offline, e);
            }
            Err(e) => {
                tracing::warn!("Failed to sync with worker {}: {}", worker, e);
                return WorkerSyncResult::failed(worker, WorkerOutcome::ExportFailed, e.to_string());
            }
        };

        // Step 2: Merge. Nothing is deleted on the worker unless this commits.
        let merged = match self.merge(&body) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Failed to merge data from worker {}: {}", worker, e);
                return WorkerSyncResult::failed(worker, WorkerOutcome::MergeFailed, e.to_string());
            }
        };
        tracing::info!(
            "Merged from worker {}: {} new tracks ({} known), {} new answers ({} known)",
            worker,
            merged.tracks_inserted,
            merged.tracks_ignored,
            merged.answers_inserted,
            merged.answers_ignored
        );

        // Step 3: Confirm delete
        let mut result = WorkerSyncResult {
            worker,
            outcome: WorkerOutcome::Synced,
            merged,
            errors: Vec::new(),
        };
        match self.delete_on_worker(worker).await {
            Ok(()) => tracing::info!("Deleted data on worker {}", worker),
            Err(e) => {
                // Merged data stays; the next pull re-merges harmlessly
                tracing::warn!("Failed to delete data on worker {}: {}", worker, e);
                result.outcome = WorkerOutcome::DeleteFailed;
                result.errors.push(e.to_string());
            }
        }

        result
    }

    // Internal methods

    async fn fetch_export(&self, worker: SocketAddr) -> HubResult<String> {
        let url = format!(
            "http://{}{}?key={}",
            worker,
            SYNC_PATH,
            urlencoding::encode(&self.sync_key)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HubError::sync(format!(
                "Export failed with status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HubError::sync(format!("Failed to read export body: {}", e)))?;

        if body.trim().is_empty() {
            return Err(HubError::sync("Empty response"));
        }

        Ok(body)
    }

    fn merge(&self, body: &str) -> HubResult<MergeSummary> {
        let document = ExportDocument::from_json(body)?;
        tracing::debug!(
            "Export document: {} tracks, {} answers",
            document.tracks.len(),
            document.answers.len()
        );
        let db = lock_database(&self.db)?;
        db.merge_export(document)
    }

    async fn delete_on_worker(&self, worker: SocketAddr) -> HubResult<()> {
        let response = self
            .client
            .delete(format!("http://{}{}", worker, SYNC_PATH))
            .json(&DeleteRequest {
                key: &self.sync_key,
            })
            .send()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HubError::sync(format!(
                "Delete failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
