//! taskcore configuration types and loading
//!
//! Mirrors the fallback chain used by the teacher daemon's own config
//! loader: explicit path, then project-local file, then user config dir,
//! then built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::message_channel::MessageChannelConfig;
use crate::rate_limiter::ProviderLimit;
use crate::scheduler::{SchedulerConfig, StrategyKind};
use crate::worker_pool::WorkerPoolConfig;
use crate::workspace_validator::WorkspaceValidatorConfig;

/// Root configuration for a taskcore run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub worker_pool: WorkerPoolConfig,
    pub message_channel: MessageChannelConfig,
    pub workspace_validator: WorkspaceValidatorConfig,
    pub providers: Vec<ProviderLimit>,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, project-local
    /// `.taskcore.yml`, user config dir, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskcore.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskcore").join("taskcore.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_reasonable_values() {
        let config = Config::default();
        assert!(config.scheduler.max_rpm > 0);
        assert!(config.worker_pool.max_workers >= 2);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yml");
        fs::write(
            &path,
            "scheduler:\n  strategy: rate-aware\n  max_rpm: 1000\nworker_pool:\n  max_workers: 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_rpm, 1000);
        assert_eq!(config.worker_pool.max_workers, 5);
        assert!(matches!(config.scheduler.strategy, StrategyKind::RateAware));
    }

    #[test]
    fn test_load_missing_explicit_file_errors() {
        let path = PathBuf::from("/nonexistent/taskcore-config-test.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
