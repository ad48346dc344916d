// Client configuration: `~/.fieldsync/config.toml`.
//
// The bearer token is never read from or written to this file; it comes from
// the `FIELDSYNC_TOKEN` environment variable.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::collection::CollectionOptions;
use crate::shape::ReconnectPolicy;

/// Environment variable holding the API bearer token.
pub const TOKEN_ENV: &str = "FIELDSYNC_TOKEN";

pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Root directory for fieldsync state: `~/.fieldsync/`.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fieldsync"))
}

/// Path to the config file: `~/.fieldsync/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Bearer token from the environment, if set and non-empty.
pub fn auth_token_from_env() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|token| !token.trim().is_empty())
}

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// API base URL (e.g. `https://api.fmtm.example.org`).
    pub api_url: String,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { api_url: DEFAULT_API_URL.to_string(), sync: SyncConfig::default() }
    }
}

impl ClientConfig {
    /// Load from `~/.fieldsync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.fieldsync/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Parsed and validated API base URL.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        validate_api_url(&self.api_url)
    }

    pub fn collection_options(&self) -> CollectionOptions {
        let sync = &self.sync;
        CollectionOptions {
            confirmation_timeout: Duration::from_millis(sync.confirmation_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(sync.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(sync.reconnect_max_delay_ms),
                max_attempts: sync.reconnect_max_attempts.unwrap_or(u32::MAX),
            },
            seed_from_snapshot: sync.seed_from_snapshot,
            notification_capacity: sync.notification_capacity,
        }
    }
}

/// Synchronization tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// How long a mutation waits for its txid on the stream before a
    /// reconciliation read.
    pub confirmation_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Unset means retry indefinitely.
    pub reconnect_max_attempts: Option<u32>,
    /// Seed new collections from the project snapshot endpoint.
    pub seed_from_snapshot: bool,
    /// Per-request timeout; must exceed the server's long-poll window.
    pub request_timeout_ms: u64,
    /// Buffered notifications per collection before slow listeners lag.
    pub notification_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 30_000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: None,
            seed_from_snapshot: true,
            request_timeout_ms: 60_000,
            notification_capacity: 1024,
        }
    }
}

/// `https` is required except for loopback hosts.
pub fn validate_api_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value).map_err(|error| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: error.to_string(),
    })?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: "api_url must use https (http is allowed only for localhost testing)"
                .to_string(),
        }),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    InvalidUrl { value: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::InvalidUrl { value, reason } => write!(f, "invalid api_url `{value}`: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
