//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/scrivener/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/scrivener/` (~/.config/scrivener/)
//! - Data: `$XDG_DATA_HOME/scrivener/` (~/.local/share/scrivener/)
//! - State/Logs: `$XDG_STATE_HOME/scrivener/` (~/.local/state/scrivener/)
//! - Runtime (markers, pid file): `$XDG_RUNTIME_DIR/scrivener/` with a
//!   temp-dir fallback when the runtime dir is unset

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

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

/// Returns XDG_RUNTIME_DIR or the system temp directory
fn xdg_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Ingestion daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ingestion daemon configuration
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::debug!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/scrivener/config.toml` (~/.config/scrivener/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("scrivener").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$XDG_DATA_HOME/scrivener/` (~/.local/share/scrivener/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("scrivener")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/scrivener/` (~/.local/state/scrivener/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("scrivener")
    }

    /// Returns the runtime directory path (live-session markers, pid file)
    ///
    /// `$XDG_RUNTIME_DIR/scrivener/`, falling back to the temp directory
    pub fn runtime_dir() -> PathBuf {
        xdg_runtime_dir().join("scrivener")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/scrivener/scrivener.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("scrivener.db")
    }

    /// Returns the append-only lifecycle hook log path
    ///
    /// `$XDG_STATE_HOME/scrivener/hooks.log` (diagnostic only)
    pub fn hooks_log_path() -> PathBuf {
        Self::state_dir().join("hooks.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
