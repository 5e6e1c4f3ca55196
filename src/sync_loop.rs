//! The manager's periodic sync loop.
//!
//! One cycle: snapshot counts, resolve workers, sync each worker in turn,
//! drop orphaned answers, regenerate metrics if anything new arrived, persist
//! the cycle state, sleep. A failing worker never ends the cycle and a
//! failing cycle never ends the loop.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::database::lock_database;
use crate::error::{HubError, HubResult};
use crate::metrics::{should_regenerate, MetricsSink};
use crate::models::StoreCounts;
use crate::reconcile::reconcile_orphans;
use crate::sync_client::{SyncClient, WorkerDirectory, WorkerOutcome, WorkerSyncResult};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Validated loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLoopConfig {
    pub host: String,
    pub port: u16,
    pub interval: Duration,
}

impl SyncLoopConfig {
    /// Validate command line input. Any problem is a configuration error.
    pub fn new(host: Option<String>, port: Option<u16>, interval_secs: Option<u64>) -> HubResult<Self> {
        let host = host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| HubError::config("Missing required argument: --host"))?;
        let port = port
            .filter(|p| *p != 0)
            .ok_or_else(|| HubError::config("Missing required argument: --port"))?;
        let interval = match interval_secs {
            None => DEFAULT_INTERVAL,
            Some(0) => return Err(HubError::config("--interval must be at least one second")),
            Some(secs) => Duration::from_secs(secs),
        };
        Ok(Self {
            host,
            port,
            interval,
        })
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Resolving,
    SyncingWorkers,
    Reconciling,
    MaybeRegeneratingMetrics,
    Sleeping,
}

/// What one cycle did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub before: StoreCounts,
    pub after: StoreCounts,
    /// Set when worker resolution failed and the cycle was cut short
    pub resolve_error: Option<String>,
    pub workers: Vec<WorkerSyncResult>,
    pub orphans_deleted: usize,
    pub metrics_regenerated: bool,
}

impl CycleReport {
    pub fn count_of(&self, outcome: WorkerOutcome) -> usize {
        self.workers.iter().filter(|w| w.outcome == outcome).count()
    }
}

/// Outcome of one worker in the last cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub outcome: WorkerOutcome,
}

/// State carried across restarts through the state file.
///
/// Reporting only: nothing about merging depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub before: StoreCounts,
    pub after: StoreCounts,
    pub workers: Vec<WorkerStatus>,
}

impl SyncState {
    /// Load the state file; a missing file means no previous state
    pub fn load(path: &Path) -> HubResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> HubResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.last_cycle_at = Some(report.started_at);
        self.before = report.before;
        self.after = report.after;
        self.workers = report
            .workers
            .iter()
            .map(|w| WorkerStatus {
                worker: w.worker.to_string(),
                outcome: w.outcome,
            })
            .collect();
    }

    /// Rows that appeared (or vanished) since the state was written
    pub fn drift(&self, current: &StoreCounts) -> StoreCounts {
        StoreCounts {
            tracks: current.tracks - self.after.tracks,
            answers: current.answers - self.after.answers,
        }
    }
}

/// The manager's sync scheduler
pub struct SyncLoop<D, M> {
    client: SyncClient,
    directory: D,
    metrics: M,
    interval: Duration,
    state_file: Option<PathBuf>,
    state: SyncState,
    phase: CyclePhase,
}

impl<D: WorkerDirectory, M: MetricsSink> SyncLoop<D, M> {
    pub fn new(client: SyncClient, directory: D, metrics: M, interval: Duration) -> Self {
        Self {
            client,
            directory,
            metrics,
            interval,
            state_file: None,
            state: SyncState::default(),
            phase: CyclePhase::Idle,
        }
    }

    /// Persist cycle state to `path` after every cycle
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    fn counts(&self) -> HubResult<StoreCounts> {
        lock_database(self.client.database())?.counts()
    }

    /// Load the previous state and log how far the store moved since then
    pub fn restore_state(&mut self) -> HubResult<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        match SyncState::load(path) {
            Ok(Some(previous)) => {
                let drift = previous.drift(&self.counts()?);
                tracing::info!(
                    "Resuming after {} cycles (last at {}); store drifted by {} tracks, {} answers since",
                    previous.cycles,
                    previous
                        .last_cycle_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    drift.tracks,
                    drift.answers
                );
                self.state = previous;
            }
            Ok(None) => tracing::debug!("No previous sync state at {}", path.display()),
            Err(e) => tracing::warn!("Ignoring unreadable sync state {}: {}", path.display(), e),
        }
        Ok(())
    }

    /// Run a single cycle, leaving the loop in `Sleeping`.
    ///
    /// Only a failure to read the store's counts is returned as an error;
    /// worker, reconcile and metrics failures are logged and recorded.
    pub async fn run_cycle(&mut self) -> HubResult<CycleReport> {
        let started_at = Utc::now().trunc_subsecs(0);
        let before = self.counts()?;
        let mut report = CycleReport {
            started_at,
            before,
            after: before,
            resolve_error: None,
            workers: Vec::new(),
            orphans_deleted: 0,
            metrics_regenerated: false,
        };

        self.phase = CyclePhase::Resolving;
        let workers = match self.directory.resolve().await {
            Ok(workers) if workers.is_empty() => {
                Err(HubError::Network("No worker addresses resolved".to_string()))
            }
            other => other,
        };
        let workers = match workers {
            Ok(workers) => workers,
            Err(e) => {
                tracing::error!("Failed to resolve workers, skipping cycle: {}", e);
                report.resolve_error = Some(e.to_string());
                self.phase = CyclePhase::Sleeping;
                self.finish(&report);
                return Ok(report);
            }
        };

        self.phase = CyclePhase::SyncingWorkers;
        for worker in workers {
            report.workers.push(self.client.sync_with_worker(worker).await);
        }

        self.phase = CyclePhase::Reconciling;
        match lock_database(self.client.database()).and_then(|db| reconcile_orphans(&db)) {
            Ok(deleted) => report.orphans_deleted = deleted,
            Err(e) => tracing::error!("Failed to delete orphaned answers: {}", e),
        }

        self.phase = CyclePhase::MaybeRegeneratingMetrics;
        report.after = self.counts()?;
        if should_regenerate(&report.before, &report.after) {
            tracing::info!(
                "Inserted {} new tracks and {} new answers",
                report.after.tracks - report.before.tracks,
                report.after.answers - report.before.answers
            );
            let regenerated = lock_database(self.client.database())
                .and_then(|db| self.metrics.regenerate(&db));
            match regenerated {
                Ok(()) => report.metrics_regenerated = true,
                Err(e) => tracing::error!("Failed to regenerate metrics: {}", e),
            }
        }

        self.phase = CyclePhase::Sleeping;
        self.finish(&report);
        Ok(report)
    }

    fn finish(&mut self, report: &CycleReport) {
        self.state.record(report);
        if let Some(path) = &self.state_file {
            if let Err(e) = self.state.save(path) {
                tracing::warn!("Failed to write sync state {}: {}", path.display(), e);
            }
        }
        tracing::info!(
            "Finished sync cycle: {} synced, {} offline, {} failed. Sleeping for {} seconds",
            report.count_of(WorkerOutcome::Synced),
            report.count_of(WorkerOutcome::Offline),
            report.workers.len()
                - report.count_of(WorkerOutcome::Synced)
                - report.count_of(WorkerOutcome::Offline),
            self.interval.as_secs()
        );
    }

    /// Cycle until `shutdown` resolves. Shutdown is observed while sleeping.
    pub async fn run<F>(mut self, shutdown: F) -> HubResult<()>
    where
        F: Future<Output = ()>,
    {
        self.restore_state()?;
        tokio::pin!(shutdown);

        loop {
            if let Err(e) = self.run_cycle().await {
                tracing::error!("Sync cycle failed: {}", e);
                self.phase = CyclePhase::Sleeping;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = &mut shutdown => {
                    tracing::info!("Sync loop stopped");
                    break;
                }
            }
            self.phase = CyclePhase::Idle;
        }
        Ok(())
    }
}


#[cfg(all(test, feature = "server"))]
mod cycle_tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::Role;
    use crate::database::{shared, Database, SharedDatabase};
    use crate::models::{Answer, Track};
    use crate::sync_client::StaticWorkerDirectory;
    use crate::sync_server::{create_router, ServerOptions};
    use tempfile::TempDir;

    const KEY: &str = "cycle-key";

    #[derive(Clone, Default)]
    struct CountingSink(Arc<AtomicUsize>);

    impl CountingSink {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl MetricsSink for CountingSink {
        fn regenerate(&self, _db: &Database) -> HubResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn spawn_worker(sessions: &[&str]) -> (SocketAddr, SharedDatabase) {
        let db = Database::new_in_memory().unwrap();
        for session in sessions {
            db.insert_track(&Track::new(*session, 0, Some(1_000))).unwrap();
            db.upsert_answer(&Answer::new(*session, "user", "How was it?")).unwrap();
        }
        let db = shared(db);

        let router = create_router(
            db.clone(),
            ServerOptions {
                role: Role::Worker,
                sync_key: KEY.to_string(),
                sync_exposed: true,
            },
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, db)
    }

    fn dead_address() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn counts(db: &SharedDatabase) -> StoreCounts {
        db.lock().unwrap().counts().unwrap()
    }

    #[tokio::test]
    async fn test_offline_worker_does_not_stop_the_others() {
        let (first, first_db) = spawn_worker(&["a1", "a2"]).await;
        let (third, third_db) = spawn_worker(&["c1"]).await;
        let directory = StaticWorkerDirectory::new(vec![first, dead_address(), third]);

        let manager = shared(Database::new_in_memory().unwrap());
        let sink = CountingSink::default();
        let client = SyncClient::new(manager.clone(), KEY).unwrap();
        let mut sync_loop = SyncLoop::new(client, directory, sink.clone(), DEFAULT_INTERVAL);

        let report = sync_loop.run_cycle().await.unwrap();

        let outcomes: Vec<WorkerOutcome> = report.workers.iter().map(|w| w.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                WorkerOutcome::Synced,
                WorkerOutcome::Offline,
                WorkerOutcome::Synced
            ]
        );
        assert_eq!(counts(&manager), StoreCounts { tracks: 3, answers: 3 });
        assert_eq!(counts(&first_db), StoreCounts::default());
        assert_eq!(counts(&third_db), StoreCounts::default());
        assert!(report.metrics_regenerated);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_metrics_only_regenerated_when_rows_arrive() {
        let (worker, worker_db) = spawn_worker(&["s1"]).await;
        let manager = shared(Database::new_in_memory().unwrap());
        let sink = CountingSink::default();
        let client = SyncClient::new(manager.clone(), KEY).unwrap();
        let mut sync_loop = SyncLoop::new(
            client,
            StaticWorkerDirectory::new(vec![worker]),
            sink.clone(),
            DEFAULT_INTERVAL,
        );

        assert!(sync_loop.run_cycle().await.unwrap().metrics_regenerated);

        // Worker is drained; nothing new arrives
        let report = sync_loop.run_cycle().await.unwrap();
        assert!(!report.metrics_regenerated);
        assert_eq!(report.before, report.after);
        assert_eq!(sink.calls(), 1);

        // An upload reaches the worker between cycles
        worker_db
            .lock()
            .unwrap()
            .insert_track(&Track::new("s2", 0, Some(10)))
            .unwrap();
        assert!(sync_loop.run_cycle().await.unwrap().metrics_regenerated);
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test]
    async fn test_orphans_removed_after_workers() {
        let (worker, _worker_db) = spawn_worker(&["s2"]).await;
        let manager = shared(Database::new_in_memory().unwrap());
        manager
            .lock()
            .unwrap()
            .upsert_answer(&Answer::new("s1", "user", "q"))
            .unwrap();

        let client = SyncClient::new(manager.clone(), KEY).unwrap();
        let mut sync_loop = SyncLoop::new(
            client,
            StaticWorkerDirectory::new(vec![worker]),
            CountingSink::default(),
            DEFAULT_INTERVAL,
        );
        let report = sync_loop.run_cycle().await.unwrap();

        assert_eq!(report.orphans_deleted, 1);
        let db = manager.lock().unwrap();
        assert!(db.get_answer("s1").unwrap().is_none());
        assert!(db.get_answer("s2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_persists_state_and_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let state_file = temp_dir.path().join("sync_state.json");
        let (worker, _worker_db) = spawn_worker(&["s1", "s2"]).await;

        let manager = shared(Database::new_in_memory().unwrap());
        let client = SyncClient::new(manager.clone(), KEY).unwrap();
        let sync_loop = SyncLoop::new(
            client,
            StaticWorkerDirectory::new(vec![worker]),
            CountingSink::default(),
            DEFAULT_INTERVAL,
        )
        .with_state_file(&state_file);

        sync_loop.run(std::future::ready(())).await.unwrap();

        let state = SyncState::load(&state_file).unwrap().unwrap();
        assert_eq!(state.cycles, 1);
        assert_eq!(state.before, StoreCounts::default());
        assert_eq!(state.after, StoreCounts { tracks: 2, answers: 2 });
        assert_eq!(state.workers[0].outcome, WorkerOutcome::Synced);

        // A restarted loop picks up where the last one left off
        let client = SyncClient::new(manager, KEY).unwrap();
        let mut restarted = SyncLoop::new(
            client,
            StaticWorkerDirectory::new(vec![worker]),
            CountingSink::default(),
            DEFAULT_INTERVAL,
        )
        .with_state_file(&state_file);
        restarted.restore_state().unwrap();
        assert_eq!(restarted.state().cycles, 1);
    }
}
