//! Configuration loading and management.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} must be positive")]
    InvalidLimit(&'static str),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Network listen configuration.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Rate limiting and escalation thresholds.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Background cleanup configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Network listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "tower.db".to_string()
}

/// Rate limiting thresholds for the escalation ladder.
///
/// Windows are trailing durations in seconds; limits are event counts
/// within the corresponding window.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Request counting window in seconds (default: 60).
    #[serde(default = "default_request_window")]
    pub request_window_secs: u64,
    /// Requests allowed per IP within the request window (default: 120).
    #[serde(default = "default_request_limit")]
    pub request_limit: usize,
    /// Throttle accumulation window in seconds (default: 24h).
    #[serde(default = "default_throttle_window")]
    pub throttle_window_secs: u64,
    /// Throttle events within the window that trigger an auto-ban (default: 5).
    #[serde(default = "default_throttle_limit")]
    pub throttle_limit: usize,
    /// Auto-ban duration in seconds (default: 24h).
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,
    /// Per-user message counting window in seconds (default: 60).
    #[serde(default = "default_message_window")]
    pub message_window_secs: u64,
    /// Messages allowed per user within the message window (default: 10).
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    /// Maximum request events retained in memory (default: 5000).
    #[serde(default = "default_log_limit")]
    pub in_memory_log_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_window_secs: default_request_window(),
            request_limit: default_request_limit(),
            throttle_window_secs: default_throttle_window(),
            throttle_limit: default_throttle_limit(),
            ban_duration_secs: default_ban_duration(),
            message_window_secs: default_message_window(),
            message_limit: default_message_limit(),
            in_memory_log_limit: default_log_limit(),
        }
    }
}

fn default_request_window() -> u64 {
    60
}

fn default_request_limit() -> usize {
    120
}

fn default_throttle_window() -> u64 {
    86_400
}

fn default_throttle_limit() -> usize {
    5
}

fn default_ban_duration() -> u64 {
    86_400
}

fn default_message_window() -> u64 {
    60
}

fn default_message_limit() -> usize {
    10
}

fn default_log_limit() -> usize {
    5000
}

impl LimitsConfig {
    /// Reject zero windows and limits before the engine is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_window_secs == 0 {
            return Err(ConfigError::InvalidLimit("limits.request_window_secs"));
        }
        if self.request_limit == 0 {
            return Err(ConfigError::InvalidLimit("limits.request_limit"));
        }
        if self.throttle_window_secs == 0 {
            return Err(ConfigError::InvalidLimit("limits.throttle_window_secs"));
        }
        if self.throttle_limit == 0 {
            return Err(ConfigError::InvalidLimit("limits.throttle_limit"));
        }
        if self.ban_duration_secs == 0 {
            return Err(ConfigError::InvalidLimit("limits.ban_duration_secs"));
        }
        if self.message_window_secs == 0 {
            return Err(ConfigError::InvalidLimit("limits.message_window_secs"));
        }
        if self.message_limit == 0 {
            return Err(ConfigError::InvalidLimit("limits.message_limit"));
        }
        if self.in_memory_log_limit == 0 {
            return Err(ConfigError::InvalidLimit("limits.in_memory_log_limit"));
        }
        Ok(())
    }

    pub fn request_window(&self) -> Duration {
        Duration::from_secs(self.request_window_secs)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window_secs)
    }
}

/// Background cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds; 0 disables the cleanup task (default: 1h).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// Token required for the admin endpoints. Generated at startup when
    /// absent; an ephemeral token changes on every restart.
    pub token: Option<String>,
}

/// Generate a random alphanumeric admin token.
pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error: the daemon runs on defaults so a
    /// bare `towerd` invocation works out of the box.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
