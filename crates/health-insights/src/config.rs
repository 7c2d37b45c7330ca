//! Configuration loaded from `config.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InsightsError, Result};

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "health-insights";

const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "aggregates.db";

/// Get the configuration directory path
/// Returns ~/.config/health-insights on Unix, ~/Library/Application Support/health-insights on macOS
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| InsightsError::config("Could not determine config directory"))
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the default storage path
pub fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding the daily aggregates
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_storage_path().join(DB_FILE_NAME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Metric codes merged at the same time within one batch
    pub max_concurrent_merges: usize,
    /// Read-merge-write attempts per metric code before giving up on conflicts
    pub max_conflict_attempts: u32,
    /// Make every write conditional on the version that was read
    pub optimistic_concurrency: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_merges: 8,
            max_conflict_attempts: 3,
            optimistic_concurrency: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| {
                InsightsError::config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location
    pub fn load_default() -> Result<Self> {
        Self::load(&default_config_path()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.merge.max_concurrent_merges == 0 {
            return Err(InsightsError::config(
                "merge.max_concurrent_merges must be at least 1",
            ));
        }
        if self.merge.max_conflict_attempts == 0 {
            return Err(InsightsError::config(
                "merge.max_conflict_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}
