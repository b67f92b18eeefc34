//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/convostat/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/convostat/` (~/.config/convostat/)
//! - Data: `$XDG_DATA_HOME/convostat/` (~/.local/share/convostat/)
//! - State/Logs: `$XDG_STATE_HOME/convostat/` (~/.local/state/convostat/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retention sweeper configuration
///
/// There is no default horizon; it must be set before sweeping.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct RetentionConfig {
    /// Delete users whose aggregate has not been updated for this many days
    pub horizon_days: Option<u32>,
}

impl RetentionConfig {
    /// The configured horizon, or a config error if unset or zero.
    pub fn horizon(&self) -> Result<chrono::Duration> {
        match self.horizon_days {
            Some(days) if days > 0 => Ok(chrono::Duration::days(days as i64)),
            Some(_) => Err(Error::Config(
                "retention.horizon_days must be greater than zero".to_string(),
            )),
            None => Err(Error::Config(
                "retention.horizon_days is required to run a sweep".to_string(),
            )),
        }
    }
}

/// Store access configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// How long a store call may wait on a locked database (milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Max retry attempts for transient store failures
    #[serde(default = "default_store_max_retries")]
    pub max_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            max_retries: default_store_max_retries(),
        }
    }
}

impl StoreConfig {
    /// Busy timeout as a duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.max(1))
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_store_max_retries() -> usize {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/convostat/config.toml` (~/.config/convostat/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("convostat").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/convostat/` (~/.local/share/convostat/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("convostat")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/convostat/` (~/.local/state/convostat/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("convostat")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/convostat/analytics.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("analytics.db")
    }
}
