//! Configuration module for Hoard.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::{HoardError, Result};

/// Server configuration for the live-update endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/hoard.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for content-addressed blobs.
    #[serde(default = "default_blob_path")]
    pub blob_path: String,
    /// Maximum upload size in megabytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size_mb: u64,
}

fn default_blob_path() -> String {
    "data/blobs".to_string()
}

fn default_max_upload_size() -> u64 {
    512
}

impl StorageConfig {
    /// Maximum upload size in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_path: default_blob_path(),
            max_upload_size_mb: default_max_upload_size(),
        }
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Quota assigned to newly created users, in megabytes.
    #[serde(default = "default_user_quota")]
    pub default_quota_mb: u64,
}

fn default_user_quota() -> u64 {
    1024
}

impl QuotaConfig {
    /// Default quota in bytes.
    pub fn default_quota_bytes(&self) -> i64 {
        (self.default_quota_mb * 1024 * 1024) as i64
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_mb: default_user_quota(),
        }
    }
}

/// Change notifier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Capacity of each subscriber outbox.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// How long a publish waits on a full outbox before dropping the subscriber.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// Events waiting for fan-out; publishes beyond this are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_outbox_capacity() -> usize {
    64
}

fn default_send_timeout() -> u64 {
    100
}

fn default_queue_capacity() -> usize {
    1024
}

impl NotifierConfig {
    /// Send deadline as a Duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: default_outbox_capacity(),
            send_timeout_ms: default_send_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Mutation rate governor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Admitted mutations per (user, endpoint) per window.
    #[serde(default = "default_max_mutations")]
    pub max_mutations: u32,
    /// Window length in milliseconds.
    #[serde(default = "default_window")]
    pub window_ms: u64,
}

fn default_max_mutations() -> u32 {
    2
}

fn default_window() -> u64 {
    1000
}

impl RateLimitConfig {
    /// Window length as a Duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_mutations: default_max_mutations(),
            window_ms: default_window(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/hoard.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Quota configuration.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Change notifier configuration.
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Mutation rate governor configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(HoardError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HoardError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `HOARD_DATABASE_PATH`: Override the database file path
    /// - `HOARD_BLOB_PATH`: Override the blob storage root
    /// - `HOARD_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_env("HOARD_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(path) = non_empty_env("HOARD_BLOB_PATH") {
            self.storage.blob_path = path;
        }
        if let Some(level) = non_empty_env("HOARD_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_mutations == 0 {
            return Err(HoardError::Config(
                "rate_limit.max_mutations must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(HoardError::Config(
                "rate_limit.window_ms must be greater than 0".to_string(),
            ));
        }
        if self.notifier.outbox_capacity == 0 {
            return Err(HoardError::Config(
                "notifier.outbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.notifier.queue_capacity == 0 {
            return Err(HoardError::Config(
                "notifier.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(HoardError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);

        assert_eq!(config.database.path, "data/hoard.db");
        assert_eq!(config.database.max_connections, 5);

        assert_eq!(config.storage.blob_path, "data/blobs");
        assert_eq!(config.storage.max_upload_size_mb, 512);
        assert_eq!(config.storage.max_upload_bytes(), 512 * 1024 * 1024);

        assert_eq!(config.quota.default_quota_mb, 1024);

        assert_eq!(config.notifier.outbox_capacity, 64);
        assert_eq!(config.notifier.send_timeout(), Duration::from_millis(100));
        assert_eq!(config.notifier.queue_capacity, 1024);

        assert_eq!(config.rate_limit.max_mutations, 2);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(1));

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/hoard.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
path = "custom/db.sqlite"
max_connections = 2

[storage]
blob_path = "/srv/blobs"
max_upload_size_mb = 64

[quota]
default_quota_mb = 10

[notifier]
outbox_capacity = 8
send_timeout_ms = 20
queue_capacity = 32

[rate_limit]
max_mutations = 5
window_ms = 2000

[logging]
level = "debug"
file = "custom.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.path, "custom/db.sqlite");
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.storage.blob_path, "/srv/blobs");
        assert_eq!(config.storage.max_upload_size_mb, 64);
        assert_eq!(config.quota.default_quota_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.notifier.outbox_capacity, 8);
        assert_eq!(config.notifier.send_timeout_ms, 20);
        assert_eq!(config.notifier.queue_capacity, 32);
        assert_eq!(config.rate_limit.max_mutations, 5);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(2));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom.log");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[storage]
blob_path = "elsewhere"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.storage.blob_path, "elsewhere");
        assert_eq!(config.storage.max_upload_size_mb, 512);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.database.path, "data/hoard.db");
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("[server\nport = ");

        if let Err(HoardError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(HoardError::Io(_))));
    }

    #[test]
    fn test_apply_env_overrides() {
        let original = std::env::var("HOARD_BLOB_PATH").ok();

        std::env::set_var("HOARD_BLOB_PATH", "/tmp/env-blobs");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.storage.blob_path, "/tmp/env-blobs");

        std::env::set_var("HOARD_BLOB_PATH", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.storage.blob_path, "data/blobs");

        if let Some(val) = original {
            std::env::set_var("HOARD_BLOB_PATH", val);
        } else {
            std::env::remove_var("HOARD_BLOB_PATH");
        }
    }

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_mutations() {
        let mut config = Config::default();
        config.rate_limit.max_mutations = 0;

        let result = config.validate();
        if let Err(HoardError::Config(msg)) = result {
            assert!(msg.contains("max_mutations"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_validate_zero_outbox() {
        let mut config = Config::default();
        config.notifier.outbox_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_event_queue() {
        let mut config = Config::default();
        config.notifier.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(HoardError::Config(_))));
    }
}
