// src/config.rs

use crate::downloader::TransferSettings;
use crate::retry::RetryPolicy;
use crate::sweeper::SweepSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "taper";

/// Engine configuration loaded from `~/.config/taper/config.toml`.
/// Missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of jobs in `Downloading` at once.
    pub concurrency_cap: usize,
    /// Seconds between scheduled dispatch cycles.
    pub dispatch_interval_secs: u64,
    /// Seconds between maintenance sweeps.
    pub maintenance_interval_secs: u64,
    /// Failures allowed before a job is terminally failed.
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// How long a deletion mark can be undone before files are removed.
    pub deletion_grace_secs: u64,
    /// How long cancelled and terminally failed rows are kept.
    pub retention_secs: u64,
    /// A `Downloading` row without a checkpoint for this long is an orphan.
    pub heartbeat_timeout_secs: u64,
    pub checkpoint_interval_ms: u64,
    pub stall_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Write buffer size for transfers, in bytes.
    pub chunk_size: usize,
    /// Dispatch pauses and eviction starts below this much free space.
    pub min_free_storage_bytes: u64,
    /// Where recordings are stored; defaults to `~/.local/share/taper/downloads`.
    pub download_root: Option<PathBuf>,
    /// Job database; defaults to `~/.local/share/taper/jobs.db`.
    pub database_path: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 3,
            dispatch_interval_secs: 15 * 60,
            maintenance_interval_secs: 24 * 60 * 60,
            max_retries: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 6 * 60 * 60,
            deletion_grace_secs: 24 * 60 * 60,
            retention_secs: 7 * 24 * 60 * 60,
            heartbeat_timeout_secs: 5 * 60,
            checkpoint_interval_ms: 2000,
            stall_timeout_secs: 60,
            connect_timeout_secs: 30,
            chunk_size: 256 * 1024,
            min_free_storage_bytes: 500 * 1024 * 1024,
            download_root: None,
            database_path: None,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.backoff_base_secs),
            max_delay: Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            chunk_size: self.chunk_size.max(4096),
            checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms.max(1)),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs.max(1)),
            retry: self.retry_policy(),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            retry: self.retry_policy(),
            deletion_grace: Duration::from_secs(self.deletion_grace_secs),
            retention: Duration::from_secs(self.retention_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            min_free_storage: self.min_free_storage_bytes,
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Configured download root, or the XDG data directory.
    pub fn resolve_download_root(&self) -> Result<PathBuf> {
        match &self.download_root {
            Some(root) => Ok(root.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_NAME)?;
                Ok(xdg_dirs.create_data_directory("downloads")?)
            }
        }
    }

    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_NAME)?;
                Ok(xdg_dirs.place_data_file("jobs.db")?)
            }
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_NAME)?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    load_or_init_at(&config_path()?)
}

pub fn load_or_init_at(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.concurrency_cap, 3);
        assert_eq!(cfg.dispatch_interval(), Duration::from_secs(900));
        assert_eq!(cfg.maintenance_interval(), Duration::from_secs(86400));
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(30));
        assert_eq!(policy.max_delay, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
            concurrency_cap = 1
            max_retries = 2
            download_root = "/srv/recordings"
        "#;
        let cfg: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.concurrency_cap, 1);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.download_root, Some(PathBuf::from("/srv/recordings")));
        assert_eq!(cfg.backoff_base_secs, 30);
        assert_eq!(cfg.resolve_download_root().unwrap(), PathBuf::from("/srv/recordings"));
    }

    #[test]
    fn load_or_init_writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let created = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, EngineConfig::default());

        fs::write(&path, "concurrency_cap = 7\n").unwrap();
        assert_eq!(load_or_init_at(&path).unwrap().concurrency_cap, 7);
    }

    #[test]
    fn settings_are_derived_from_config() {
        let cfg = EngineConfig {
            checkpoint_interval_ms: 500,
            heartbeat_timeout_secs: 10,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.transfer_settings().checkpoint_interval, Duration::from_millis(500));
        assert_eq!(cfg.sweep_settings().heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(cfg.sweep_settings().retry.max_retries, 5);
    }
}
