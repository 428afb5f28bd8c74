//! Server configuration loading from file and environment variables.

use ripple_store::DbRuntimeSettings;
use ripple_types::DEFAULT_URL_PREFIX;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Connector string, e.g. `sqlite://ripple.db` or `memory://`.
    #[serde(default = "default_connector")]
    pub connector: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Tunables of the sync protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Route prefix, with leading and trailing slash.
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,

    /// Window used to coalesce events into one poll response.
    #[serde(default = "default_grouping_delay_ms")]
    pub grouping_delay_ms: u64,

    /// How long a poll is held open, and the listen recheck period.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_tokens_per_origin")]
    pub max_tokens_per_origin: u64,

    /// Bus subscription count above which a warning is logged.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Prefix of the internal token and queued-event collections.
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "ripple_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_connector() -> String {
    "sqlite://ripple.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_url_prefix() -> String {
    DEFAULT_URL_PREFIX.to_string()
}

fn default_grouping_delay_ms() -> u64 {
    200
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

fn default_max_tokens_per_origin() -> u64 {
    16
}

fn default_max_subscriptions() -> usize {
    131_072
}

fn default_collection_prefix() -> String {
    "rp_".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connector: default_connector(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl StorageConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url_prefix: default_url_prefix(),
            grouping_delay_ms: default_grouping_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_tokens_per_origin: default_max_tokens_per_origin(),
            max_subscriptions: default_max_subscriptions(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

impl SyncConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }

    pub fn grouping_delay(&self) -> Duration {
        Duration::from_millis(self.grouping_delay_ms)
    }

    /// The prefix normalized to `/segment/.../`.
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.url_prefix.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    pub fn tokens_collection(&self) -> String {
        format!("{}tokens", self.collection_prefix)
    }

    pub fn events_collection(&self) -> String {
        format!("{}events", self.collection_prefix)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `RIPPLE_HOST` overrides `server.host`
/// - `RIPPLE_PORT` overrides `server.port`
/// - `RIPPLE_STORAGE` overrides `storage.connector`
/// - `RIPPLE_LOG_LEVEL` overrides `logging.level`
/// - `RIPPLE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `RIPPLE_IDLE_TIMEOUT_MS` overrides `sync.idle_timeout_ms`
/// - `RIPPLE_GROUPING_DELAY_MS` overrides `sync.grouping_delay_ms`
/// - `RIPPLE_MAX_TOKENS_PER_ORIGIN` overrides `sync.max_tokens_per_origin`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("RIPPLE_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("RIPPLE_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(connector) = var("RIPPLE_STORAGE") {
        config.storage.connector = connector;
    }
    if let Some(level) = var("RIPPLE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("RIPPLE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(parsed) = var("RIPPLE_IDLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.sync.idle_timeout_ms = parsed;
    }
    if let Some(parsed) = var("RIPPLE_GROUPING_DELAY_MS").and_then(|v| v.parse().ok()) {
        config.sync.grouping_delay_ms = parsed;
    }
    if let Some(parsed) = var("RIPPLE_MAX_TOKENS_PER_ORIGIN").and_then(|v| v.parse().ok()) {
        config.sync.max_tokens_per_origin = parsed;
    }
}
