use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::http::ClientConfig;
use crate::pool::PoolConfig;

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum open connections across all routes (default: 500)
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Maximum open connections per route (default: 300)
    #[serde(default = "default_max_per_route")]
    pub max_per_route: usize,

    /// Idle time before a pooled connection is closed, in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Interval of the idle sweep, in milliseconds
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum wait for a free connection, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_total() -> usize {
    500
}

fn default_max_per_route() -> usize {
    300
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_eviction_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_per_route: default_max_per_route(),
            idle_timeout_ms: default_idle_timeout_ms(),
            eviction_interval_ms: default_eviction_interval_ms(),
            connect_timeout_ms: default_timeout_ms(),
            acquire_timeout_ms: default_timeout_ms(),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        PoolConfig {
            max_total_connections: s.max_total,
            max_per_route: s.max_per_route,
            idle_timeout: Duration::from_millis(s.idle_timeout_ms),
            eviction_interval: Duration::from_millis(s.eviction_interval_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            acquire_timeout: Duration::from_millis(s.acquire_timeout_ms),
        }
    }
}

/// Request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// User-Agent sent when the caller does not set one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_timeout_ms(),
            user_agent: None,
        }
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(s: &ClientSettings) -> Self {
        let mut config = ClientConfig {
            read_timeout: Duration::from_millis(s.read_timeout_ms),
            ..ClientConfig::default()
        };
        if let Some(user_agent) = &s.user_agent {
            config.user_agent = user_agent.clone();
        }
        config
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Request settings
    #[serde(default)]
    pub client: ClientSettings,
}

impl Config {
    /// Check the cap and timeout invariants
    pub fn validate(&self) -> Result<()> {
        PoolConfig::from(&self.pool)
            .validate()
            .context("Invalid pool settings")?;

        if self.client.read_timeout_ms == 0 {
            anyhow::bail!("read_timeout_ms must be positive");
        }

        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Every variable is optional; unset ones keep their defaults:
/// - GETPOOL_MAX_TOTAL / GETPOOL_MAX_PER_ROUTE
/// - GETPOOL_IDLE_TIMEOUT_MS / GETPOOL_EVICTION_INTERVAL_MS
/// - GETPOOL_CONNECT_TIMEOUT_MS / GETPOOL_ACQUIRE_TIMEOUT_MS / GETPOOL_READ_TIMEOUT_MS
/// - GETPOOL_USER_AGENT
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Some(val) = env_number("GETPOOL_MAX_TOTAL")? {
        config.pool.max_total = val as usize;
    }
    if let Some(val) = env_number("GETPOOL_MAX_PER_ROUTE")? {
        config.pool.max_per_route = val as usize;
    }
    if let Some(val) = env_number("GETPOOL_IDLE_TIMEOUT_MS")? {
        config.pool.idle_timeout_ms = val;
    }
    if let Some(val) = env_number("GETPOOL_EVICTION_INTERVAL_MS")? {
        config.pool.eviction_interval_ms = val;
    }
    if let Some(val) = env_number("GETPOOL_CONNECT_TIMEOUT_MS")? {
        config.pool.connect_timeout_ms = val;
    }
    if let Some(val) = env_number("GETPOOL_ACQUIRE_TIMEOUT_MS")? {
        config.pool.acquire_timeout_ms = val;
    }
    if let Some(val) = env_number("GETPOOL_READ_TIMEOUT_MS")? {
        config.client.read_timeout_ms = val;
    }
    if let Ok(user_agent) = std::env::var("GETPOOL_USER_AGENT") {
        config.client.user_agent = Some(user_agent);
    }

    Ok(config)
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .context(format!("{} is not a number: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables. The result is validated either way.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config.validate()?;
    Ok(config)
}
