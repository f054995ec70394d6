//! CLI configuration file support.
//!
//! This module provides support for loading configuration from TOML files.
//! Configuration can be loaded from:
//! 1. An explicit path specified via --config flag
//! 2. The XDG config directory (~/.config/runlock/config.toml)
//! 3. Fall back to defaults

use runlock::FileLockStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config '{path}': {source}")]
    TomlError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Lock configuration. Locks are always lock files shared by every process
/// on the host.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Lock file directory (default: <temp_dir>/runlock).
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Age in seconds after which a lock counts as stale where the holder's
    /// pid cannot be checked (non-Linux). Unset: such locks never go stale.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

impl LockConfig {
    /// Lock directory, with `cli_dir` taking priority over the file value.
    pub fn resolve_dir(&self, cli_dir: Option<PathBuf>) -> PathBuf {
        cli_dir
            .or_else(|| self.dir.clone())
            .unwrap_or_else(FileLockStore::default_dir)
    }

    /// Lock store for the resolved directory.
    pub fn file_store(&self, cli_dir: Option<PathBuf>) -> FileLockStore {
        let store = FileLockStore::new(self.resolve_dir(cli_dir));
        match self.stale_after_secs {
            Some(secs) => store.with_stale_after(Duration::from_secs(secs)),
            None => store,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (default: info).
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::TomlError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the default XDG config path (~/.config/runlock/config.toml).
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("runlock");
            path.push("config.toml");
            path
        })
    }

    /// Load configuration with priority:
    /// 1. Explicit config path if provided
    /// 2. XDG config path if it exists
    /// 3. Default configuration
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Some(path) = Self::default_config_path()
            && path.exists()
        {
            return Self::from_file(&path);
        }

        Ok(Self::default())
    }
}
