//! Terminal configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use tillsync_api::ApiConfig;
use tillsync_common::{BranchId, DeviceId, Error, Result, TenantId};
use tillsync_sync::{DeviceIdentity, RealtimeConfig, RetryConfig, SchedulerConfig, DEFAULT_RETENTION_DAYS};

/// Database file name used when no explicit path is configured.
pub const DEFAULT_DATABASE_FILE: &str = "terminal.db";

/// Everything a terminal needs to start, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub device_id: String,
    pub branch_id: String,
    pub tenant_id: String,
    /// Local database; defaults to `terminal.db` in the data directory.
    pub database_path: Option<PathBuf>,
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub scheduler: SchedulerConfig,
    /// Backoff for reference sync fetches.
    pub sync_retry: RetryConfig,
    /// Days synced operations are kept before purge.
    pub retention_days: i64,
    /// Unauthenticated path probed to detect reachability.
    pub health_path: String,
    /// Seconds between reachability probes while running in the background.
    pub probe_interval_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            device_id: format!("terminal-{}", uuid::Uuid::new_v4()),
            branch_id: String::new(),
            tenant_id: String::new(),
            database_path: None,
            api: ApiConfig::default(),
            realtime: RealtimeConfig::default(),
            scheduler: SchedulerConfig::default(),
            sync_retry: RetryConfig::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
            health_path: "/health".to_string(),
            probe_interval_secs: 15,
        }
    }
}

impl TerminalConfig {
    /// Load a config file.
    ///
    /// # Errors
    /// - File unreadable
    /// - Invalid JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validated identity of this terminal.
    ///
    /// # Errors
    /// - `Config` when any identifier is blank
    pub fn identity(&self) -> Result<DeviceIdentity> {
        let field = |name: &str, err: Error| Error::Config(format!("{}: {}", name, err));

        Ok(DeviceIdentity {
            device_id: DeviceId::new(&self.device_id).map_err(|e| field("device_id", e))?,
            branch_id: BranchId::new(&self.branch_id).map_err(|e| field("branch_id", e))?,
            tenant_id: TenantId::new(&self.tenant_id).map_err(|e| field("tenant_id", e))?,
        })
    }

    /// Database location, resolved against `data_dir`.
    pub fn database_path_in(&self, data_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| data_dir.join(DEFAULT_DATABASE_FILE))
    }
}
