//! Configuration file parser for `~/.config/feedkeep/config.toml`.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchSettings;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("HOME environment variable not set")]
    NoHome,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Every field has a default so any subset of keys can be given.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. Defaults to `feedkeep.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Feeds fetched at the same time.
    pub concurrent_downloads: usize,

    /// Unflagged articles older than this many days are purged. 0 = never.
    pub auto_expire_days: u32,

    /// GUIDs of purged articles are remembered this many days.
    pub guid_history_days: u32,

    /// Minutes between automatic refreshes. 0 = manual refresh only.
    pub refresh_interval_minutes: u64,

    pub request_timeout_secs: u64,

    /// Retries for transient network failures, per request.
    pub max_retries: u32,

    /// First retry delay; doubles on every further attempt.
    pub retry_base_delay_ms: u64,

    pub user_agent: String,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    pub sync: SyncConfig,
}

/// OpenReader account.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server base URL, e.g. `https://reader.example.com`.
    pub server: Option<String>,
    pub username: Option<String>,
    /// Prefer the credential store; this is a fallback for headless use.
    pub password: Option<String>,
}

impl SyncConfig {
    pub fn is_configured(&self) -> bool {
        self.server.is_some() && self.username.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            concurrent_downloads: 10,
            auto_expire_days: 0,
            guid_history_days: 180,
            refresh_interval_minutes: 0,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            user_agent: concat!("feedkeep/", env!("CARGO_PKG_VERSION")).to_string(),
            log_level: "info".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .field("auto_expire_days", &self.auto_expire_days)
            .field("guid_history_days", &self.guid_history_days)
            .field("refresh_interval_minutes", &self.refresh_interval_minutes)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("user_agent", &self.user_agent)
            .field("log_level", &self.log_level)
            .field("sync", &self.sync)
            .finish()
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "concurrent_downloads",
    "auto_expire_days",
    "guid_history_days",
    "refresh_interval_minutes",
    "request_timeout_secs",
    "max_retries",
    "retry_base_delay_ms",
    "user_agent",
    "log_level",
    "sync",
];

const KNOWN_SYNC_KEYS: &[&str] = &["server", "username", "password"];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// `~/.config/feedkeep`.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(".config").join("feedkeep"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown(&raw, KNOWN_KEYS, "");
            if let Some(toml::Value::Table(sync)) = raw.get("sync") {
                warn_unknown(sync, KNOWN_SYNC_KEYS, "sync.");
            }
        }

        let mut config: Config = toml::from_str(content)?;
        if config.concurrent_downloads == 0 {
            tracing::warn!("concurrent_downloads = 0 would never fetch anything, using 1");
            config.concurrent_downloads = 1;
        }
        tracing::debug!(
            concurrent_downloads = config.concurrent_downloads,
            sync = config.sync.is_configured(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Database file, resolving the default against `config_dir`.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feedkeep.db"))
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            user_agent: self.user_agent.clone(),
            ..FetchSettings::default()
        }
    }
}

fn warn_unknown(table: &toml::Table, known: &[&str], prefix: &str) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            tracing::warn!(key = %format!("{prefix}{key}"), "Unknown key in config file, ignoring");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
