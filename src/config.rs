//! A1 — layered configuration for the sync engine (§4.9).
//!
//! Loaded from a TOML file (path given on the CLI or `WAREHOUSE_SYNC_CONF`),
//! then overridden field-by-field by `WAREHOUSE_SYNC_*` environment
//! variables. Missing sections default; `warehouse.url` and
//! `redis.connection` are validated at startup, not at first use, because a
//! misconfigured process should fail before it ever reaches the network.

use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::errors::SyncError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub index: IndexConfig,
    pub redis: RedisConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WarehouseConfig {
    pub url: String,
    pub auth: WarehouseAuth,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WarehouseAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub url: String,
    pub ssl_verify: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ssl_verify: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RedisConfig {
    pub connection: Option<RedisConnection>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConnection {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
}

impl Default for RedisConnection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConnection {
    /// The `redis://[:password@]host:port/db` URL the `redis` crate expects.
    pub fn to_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScheduleConfig {
    pub packages: Option<PackagesSchedule>,
}

/// The polling interval for the package-sync loop, in whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackagesSchedule {
    pub interval_seconds: u64,
}

impl Default for PackagesSchedule {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// A `tracing-subscriber` `EnvFilter` string.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML file from `path`, then applies `WAREHOUSE_SYNC_*`
    /// environment overrides, then validates the required sections.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("could not read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("could not parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config file path from the CLI argument, falling back to
    /// `WAREHOUSE_SYNC_CONF`.
    pub fn resolve_path(cli_path: Option<&Path>) -> Result<std::path::PathBuf, SyncError> {
        if let Some(path) = cli_path {
            return Ok(path.to_path_buf());
        }
        env::var("WAREHOUSE_SYNC_CONF")
            .map(std::path::PathBuf::from)
            .map_err(|_| {
                SyncError::Config(
                    "no config path given and WAREHOUSE_SYNC_CONF is not set".to_string(),
                )
            })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("WAREHOUSE_SYNC_WAREHOUSE_URL") {
            self.warehouse.url = url;
        }
        if let Ok(username) = env::var("WAREHOUSE_SYNC_WAREHOUSE_USERNAME") {
            self.warehouse.auth.username = username;
        }
        if let Ok(password) = env::var("WAREHOUSE_SYNC_WAREHOUSE_PASSWORD") {
            self.warehouse.auth.password = password;
        }
        if let Ok(url) = env::var("WAREHOUSE_SYNC_INDEX_URL") {
            self.index.url = url;
        }
        if let Ok(filter) = env::var("WAREHOUSE_SYNC_LOG") {
            self.logging.filter = filter;
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.warehouse.url.is_empty() {
            return Err(SyncError::Config("warehouse.url is required".to_string()));
        }
        if self.index.url.is_empty() {
            return Err(SyncError::Config("index.url is required".to_string()));
        }
        if self.redis.connection.is_none() {
            return Err(SyncError::Config(
                "redis.connection is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let toml = r#"
            [warehouse]
            url = "https://warehouse.example/api"

            [warehouse.auth]
            username = "sync"
            password = "secret"

            [index]
            url = "https://index.example/pypi"
            ssl_verify = false

            [redis.connection]
            host = "redis.internal"
            port = 6380
            db = 2

            redis.prefix = "pypi:"

            [schedule.packages]
            interval_seconds = 45

            [logging]
            filter = "debug"
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.warehouse.url, "https://warehouse.example/api");
        assert_eq!(config.warehouse.auth.username, "sync");
        assert!(!config.index.ssl_verify);
        assert_eq!(config.redis.connection.unwrap().port, 6380);
        assert_eq!(
            config.schedule.packages.unwrap().interval_seconds,
            45
        );
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn missing_warehouse_url_is_fatal() {
        let toml = r#"
            [index]
            url = "https://index.example/pypi"

            [redis.connection]
            host = "localhost"
            port = 6379
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn missing_redis_connection_is_fatal() {
        let toml = r#"
            [warehouse]
            url = "https://warehouse.example/api"

            [index]
            url = "https://index.example/pypi"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn logging_defaults_to_info() {
        assert_eq!(LoggingConfig::default().filter, "info");
    }

    #[test]
    fn redis_connection_to_url_with_and_without_password() {
        let without = RedisConnection {
            host: "localhost".into(),
            port: 6379,
            db: 0,
            password: None,
        };
        assert_eq!(without.to_url(), "redis://localhost:6379/0");

        let with = RedisConnection {
            password: Some("hunter2".into()),
            ..without
        };
        assert_eq!(with.to_url(), "redis://:hunter2@localhost:6379/0");
    }

    #[test]
    fn load_reads_a_real_file_and_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse-sync.toml");
        std::fs::write(
            &path,
            r#"
                [warehouse]
                url = "https://warehouse.example/api"

                [index]
                url = "https://index.example/pypi"

                [redis.connection]
                host = "localhost"
                port = 6379
            "#,
        )
        .unwrap();

        // SAFETY: this test runs single-threaded within the process and
        // restores the variable before returning.
        unsafe {
            env::set_var("WAREHOUSE_SYNC_LOG", "trace");
        }
        let config = Config::load(&path).unwrap();
        unsafe {
            env::remove_var("WAREHOUSE_SYNC_LOG");
        }

        assert_eq!(config.warehouse.url, "https://warehouse.example/api");
        assert_eq!(config.logging.filter, "trace");
    }

    #[test]
    fn load_reports_a_config_error_for_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        assert!(matches!(Config::load(&path), Err(SyncError::Config(_))));
    }
}
