//! Configuration management for trackhub.
//!
//! This module handles loading and saving instance configuration to/from a
//! JSON file in a config directory. Secrets and the role can be overridden
//! from the environment so containers need no config file at all:
//! - `SYNC_KEY`: shared secret for the worker sync endpoints
//! - `WORKER_MODE`: `true` runs the instance as a worker
//! - `SYNC_EXPOSED`: `true` mounts the sync endpoints

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Which side of the sync protocol this instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Edge instance: accepts uploads, is drained by the manager
    Worker,
    /// Central instance: pulls from workers
    #[default]
    Manager,
}

impl Role {
    pub fn is_worker(&self) -> bool {
        matches!(self, Role::Worker)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Worker => write!(f, "worker"),
            Role::Manager => write!(f, "manager"),
        }
    }
}

/// Filesystem locations the store, the sync loop and the metrics sink write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_file: PathBuf,
    /// Persisted sync cycle state (None disables persistence)
    pub state_file: Option<PathBuf>,
    /// Derived metrics snapshot (None disables the snapshot sink)
    pub metrics_file: Option<PathBuf>,
}

impl StorageConfig {
    /// All files placed side by side in one directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_file: dir.join("trackhub.db"),
            state_file: Some(dir.join("sync_state.json")),
            metrics_file: Some(dir.join("metrics.json")),
        }
    }
}

fn default_server_port() -> u16 {
    8000
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    #[serde(default)]
    pub role: Role,
    /// Shared secret for the sync endpoints; empty authorizes nothing
    #[serde(default)]
    pub sync_key: String,
    /// Whether the sync endpoints are mounted at all
    #[serde(default)]
    pub sync_exposed: bool,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Path to the persisted sync cycle state
    pub state_file: Option<String>,
    /// Path to the derived metrics snapshot
    pub metrics_file: Option<String>,
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            role: Role::default(),
            sync_key: String::new(),
            sync_exposed: false,
            server_port: default_server_port(),
            state_file: None,
            metrics_file: None,
        }
    }
}

impl ConfigData {
    fn with_dir_defaults(mut self, config_dir: &Path) -> Self {
        let storage = StorageConfig::in_dir(config_dir);
        if self.database_file.is_empty() {
            self.database_file = storage.database_file.to_string_lossy().to_string();
        }
        if self.state_file.is_none() {
            self.state_file = storage
                .state_file
                .map(|p| p.to_string_lossy().to_string());
        }
        if self.metrics_file.is_none() {
            self.metrics_file = storage
                .metrics_file
                .map(|p| p.to_string_lossy().to_string());
        }
        self
    }
}

/// Configuration manager
pub struct Config {
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Load (or create) the configuration in `config_dir`.
    ///
    /// Falls back to `./trackhub` when no directory is given. An unreadable
    /// or malformed config file is an error rather than silently replaced,
    /// since it carries the sync key.
    pub fn new(config_dir: Option<PathBuf>) -> HubResult<Self> {
        let config_dir = config_dir.unwrap_or_else(|| PathBuf::from("trackhub"));

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let data = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str::<ConfigData>(&content).map_err(|e| {
                HubError::config(format!("Invalid {}: {}", config_file.display(), e))
            })?
        } else {
            ConfigData::default()
        };
        let data = data.with_dir_defaults(&config_dir);

        let config = Self {
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Apply `SYNC_KEY`, `WORKER_MODE` and `SYNC_EXPOSED` from the process
    /// environment. Overrides are not written back to the file.
    pub fn apply_env_overrides(&mut self) -> HubResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> HubResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("SYNC_KEY") {
            self.data.sync_key = key;
        }
        if let Some(value) = lookup("WORKER_MODE") {
            self.data.role = if parse_flag("WORKER_MODE", &value)? {
                Role::Worker
            } else {
                Role::Manager
            };
        }
        if let Some(value) = lookup("SYNC_EXPOSED") {
            self.data.sync_exposed = parse_flag("SYNC_EXPOSED", &value)?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> HubResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn role(&self) -> Role {
        self.data.role
    }

    pub fn set_role(&mut self, role: Role) -> HubResult<()> {
        self.data.role = role;
        self.save()
    }

    pub fn sync_key(&self) -> &str {
        &self.data.sync_key
    }

    pub fn set_sync_key(&mut self, key: &str) -> HubResult<()> {
        self.data.sync_key = key.to_string();
        self.save()
    }

    pub fn is_sync_exposed(&self) -> bool {
        self.data.sync_exposed
    }

    pub fn set_sync_exposed(&mut self, exposed: bool) -> HubResult<()> {
        self.data.sync_exposed = exposed;
        self.save()
    }

    pub fn server_port(&self) -> u16 {
        self.data.server_port
    }

    /// Storage locations derived from this configuration
    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            database_file: PathBuf::from(&self.data.database_file),
            state_file: self.data.state_file.as_ref().map(PathBuf::from),
            metrics_file: self.data.metrics_file.as_ref().map(PathBuf::from),
        }
    }
}

fn parse_flag(name: &str, value: &str) -> HubResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(HubError::config(format!(
            "{} must be true or false, got {:?}",
            name, other
        ))),
    }
}
