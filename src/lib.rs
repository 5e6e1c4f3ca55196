//! trackhub - ingestion and distribution backend for ride tracks and survey answers.
//!
//! This library provides:
//! - Data models (Track, Answer) and the sync export document
//! - Database operations (SQLite)
//! - The manager/worker sync protocol (client, worker endpoint, control loop)
//! - Orphan reconciliation, track clean-up and derived metrics
//! - Configuration management
//!
//! # Feature Flags
//!
//! - `server`: Include the HTTP server components (axum) and the `trackhub` binary.

pub mod cleanup;
pub mod config;
pub mod database;
pub mod error;
#[cfg(feature = "server")]
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod sync_client;
pub mod sync_loop;
#[cfg(feature = "server")]
pub mod sync_server;

// Re-export commonly used types
pub use config::{Config, Role, StorageConfig};
pub use database::{Database, SharedDatabase};
pub use error::{HubError, HubResult};
pub use models::{Answer, ExportDocument, StoreCounts, Track};
pub use sync_client::{SyncClient, WorkerOutcome, WorkerSyncResult};
pub use sync_loop::{SyncLoop, SyncLoopConfig};
