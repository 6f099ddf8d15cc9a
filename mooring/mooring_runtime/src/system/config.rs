//! Configuration for the mooring runtime
//!
//! Handles loading, validating and layering the per-backend settings.
//!
//! A configuration file is TOML or JSON, chosen by extension. Each backend
//! section is optional: a missing section means that pool is not built.
//! `MOORING_*` environment variables are applied on top of whatever was
//! loaded.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use mooring_core::error::ConfigError;
use mooring_core::types::PoolOptions;
use mooring_pool::{ChannelPoolOptions, RetryPolicy};

/// Pool sizing shared by every backend section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum handles alive at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Maximum wait for a free handle (milliseconds)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Maximum wait for outstanding handles on close (milliseconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_capacity() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    3000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Convert to pool options.
    pub fn options(&self) -> PoolOptions {
        PoolOptions::with_capacity(self.capacity)
            .acquire_timeout(Duration::from_millis(self.acquire_timeout_ms))
            .drain_timeout(Duration::from_millis(self.drain_timeout_ms))
    }
}

/// Factory retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// First backoff (milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Convert to a retry policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }

    fn validate(&self, backend: &str) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{backend}: retry attempts cannot be zero"
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "{backend}: retry multiplier must be a finite number >= 1.0"
            )));
        }
        Ok(())
    }
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_warm_up() -> usize {
    1
}

fn check_endpoint(backend: &str, host: &str, port: u16) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{backend}: host cannot be empty")));
    }
    if port == 0 {
        return Err(ConfigError::Invalid(format!("{backend}: port cannot be zero")));
    }
    Ok(())
}

fn check_pool(backend: &str, pool: &PoolConfig) -> Result<(), ConfigError> {
    pool.options()
        .validate()
        .map_err(|e| ConfigError::Invalid(format!("{backend}: {e}")))
}

/// Relational store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_database_port")]
    pub port: u16,
    #[serde(default = "default_database_credential")]
    pub user: String,
    #[serde(default = "default_database_credential")]
    pub password: String,
    #[serde(default = "default_database_credential")]
    pub name: String,

    /// TCP connect timeout (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Connections opened at startup to prove the backend is reachable
    #[serde(default = "default_warm_up")]
    pub warm_up: usize,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_database_port() -> u16 {
    5432
}

fn default_database_credential() -> String {
    "mooring".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_database_port(),
            user: default_database_credential(),
            password: default_database_credential(),
            name: default_database_credential(),
            connect_timeout_ms: default_connect_timeout_ms(),
            warm_up: default_warm_up(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Connection URL with the password redacted.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.name
        )
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint("database", &self.host, self.port)?;
        if self.name.is_empty() {
            return Err(ConfigError::Invalid(
                "database: name cannot be empty".to_string(),
            ));
        }
        check_pool("database", &self.pool)?;
        self.retry.validate("database")
    }
}

impl fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: u8,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_warm_up")]
    pub warm_up: usize,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_cache_port() -> u16 {
    6379
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_cache_port(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            warm_up: default_warm_up(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Connection URL with the password redacted.
    pub fn url(&self) -> String {
        let auth = if self.password.is_some() { ":***@" } else { "" };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint("cache", &self.host, self.port)?;
        check_pool("cache", &self.pool)?;
        self.retry.validate("cache")
    }
}

impl fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Message broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_credential")]
    pub user: String,
    #[serde(default = "default_broker_credential")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Physical connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Channels multiplexed over each connection
    #[serde(default = "default_channels_per_connection")]
    pub channels_per_connection: usize,

    /// Highest channel number a connection may hand out
    #[serde(default = "default_channel_max")]
    pub channel_max: u16,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_warm_up")]
    pub warm_up: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_credential() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_max_connections() -> usize {
    2
}

fn default_channels_per_connection() -> usize {
    10
}

fn default_channel_max() -> u16 {
    2047
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_broker_port(),
            user: default_broker_credential(),
            password: default_broker_credential(),
            vhost: default_vhost(),
            max_connections: default_max_connections(),
            channels_per_connection: default_channels_per_connection(),
            channel_max: default_channel_max(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            warm_up: default_warm_up(),
            retry: RetryConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Connection URL with the password redacted.
    pub fn url(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.user, self.host, self.port, vhost
        )
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Convert to channel pool options.
    pub fn options(&self) -> ChannelPoolOptions {
        ChannelPoolOptions {
            max_connections: self.max_connections,
            channels_per_connection: self.channels_per_connection,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_endpoint("broker", &self.host, self.port)?;
        self.options()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("broker: {e}")))?;
        if usize::from(self.channel_max) < self.channels_per_connection {
            return Err(ConfigError::Invalid(format!(
                "broker: channel_max {} is below channels_per_connection {}",
                self.channel_max, self.channels_per_connection
            )));
        }
        self.retry.validate("broker")
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Relational store; absent means no database pool
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Cache; absent means no cache pool
    #[serde(default)]
    pub cache: Option<CacheConfig>,

    /// Message broker; absent means no broker pool
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Overall budget for draining every pool on stop (seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseConfig::default()),
            cache: Some(CacheConfig::default()),
            broker: Some(BrokerConfig::default()),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// A configuration with no backends.
    pub fn empty() -> Self {
        Self {
            database: None,
            cache: None,
            broker: None,
            ..Self::default()
        }
    }

    /// Shutdown budget as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Load configuration from a file, then apply `MOORING_*` overrides.
    ///
    /// Without a path, or when the file does not exist, the defaults are used.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                let content = read(path)
                    .await
                    .map_err(|e| ConfigError::LoadFailed(format!("{e:#}")))?;
                Self::parse(path, &content)
                    .map_err(|e| ConfigError::ParseFailed(format!("{e:#}")))?
            }
            Some(path) => {
                warn!("Configuration file not found: {}", path.display());
                Self::default()
            }
            None => {
                info!("No configuration file specified, using defaults");
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(content)
                .with_context(|| format!("invalid JSON in {}", path.display())),
            _ => toml::from_str(content)
                .with_context(|| format!("invalid TOML in {}", path.display())),
        }
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// A variable naming a backend that has no section creates that section
    /// with default values first.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("MOORING_{key}"));

        if let Some(v) = get("SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout_secs = parse_var("MOORING_SHUTDOWN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_JSON") {
            self.logging.json = parse_var("MOORING_LOG_JSON", &v)?;
        }

        let db_keys = ["HOST", "PORT", "USER", "PASSWORD", "NAME"];
        if db_keys.iter().any(|k| get(&format!("DATABASE_{k}")).is_some()) {
            let db = self.database.get_or_insert_with(DatabaseConfig::default);
            if let Some(v) = get("DATABASE_HOST") {
                db.host = v;
            }
            if let Some(v) = get("DATABASE_PORT") {
                db.port = parse_var("MOORING_DATABASE_PORT", &v)?;
            }
            if let Some(v) = get("DATABASE_USER") {
                db.user = v;
            }
            if let Some(v) = get("DATABASE_PASSWORD") {
                db.password = v;
            }
            if let Some(v) = get("DATABASE_NAME") {
                db.name = v;
            }
        }

        let cache_keys = ["HOST", "PORT", "PASSWORD", "DB"];
        if cache_keys.iter().any(|k| get(&format!("CACHE_{k}")).is_some()) {
            let cache = self.cache.get_or_insert_with(CacheConfig::default);
            if let Some(v) = get("CACHE_HOST") {
                cache.host = v;
            }
            if let Some(v) = get("CACHE_PORT") {
                cache.port = parse_var("MOORING_CACHE_PORT", &v)?;
            }
            if let Some(v) = get("CACHE_PASSWORD") {
                cache.password = Some(v);
            }
            if let Some(v) = get("CACHE_DB") {
                cache.db = parse_var("MOORING_CACHE_DB", &v)?;
            }
        }

        let broker_keys = ["HOST", "PORT", "USER", "PASSWORD", "VHOST"];
        if broker_keys.iter().any(|k| get(&format!("BROKER_{k}")).is_some()) {
            let broker = self.broker.get_or_insert_with(BrokerConfig::default);
            if let Some(v) = get("BROKER_HOST") {
                broker.host = v;
            }
            if let Some(v) = get("BROKER_PORT") {
                broker.port = parse_var("MOORING_BROKER_PORT", &v)?;
            }
            if let Some(v) = get("BROKER_USER") {
                broker.user = v;
            }
            if let Some(v) = get("BROKER_PASSWORD") {
                broker.password = v;
            }
            if let Some(v) = get("BROKER_VHOST") {
                broker.vhost = v;
            }
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "Shutdown timeout cannot be zero".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("Log level cannot be empty".to_string()));
        }
        if let Some(db) = &self.database {
            db.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        if let Some(broker) = &self.broker {
            broker.validate()?;
        }
        if self.database.is_none() && self.cache.is_none() && self.broker.is_none() {
            warn!("No backends configured");
        }
        Ok(())
    }

    /// Merge with another configuration
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.database.is_some() {
            self.database = other.database;
        }
        if other.cache.is_some() {
            self.cache = other.cache;
        }
        if other.broker.is_some() {
            self.broker = other.broker;
        }
        if other.shutdown_timeout_secs > 0 {
            self.shutdown_timeout_secs = other.shutdown_timeout_secs;
        }
        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }
    }
}

async fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read configuration file: {}", path.display()))
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::ParseFailed(format!("{key}={value:?}: {e}")))
}
