//! Configuration loading from file and environment variables.

use std::path::PathBuf;

use kseekers_db::PoolSettings;
use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database and pool settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration script location.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Connections kept open while idle; unset means fill the pool up front.
    #[serde(default)]
    pub pool_min_idle: Option<u32>,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a checkout may wait for a free connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `{version}_{name}.sql` and `R{version}.sql` files.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "kseekers_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "kseekers.db".to_string()
}

fn default_pool_max_size() -> u32 {
    PoolSettings::default().pool_max_size
}

fn default_busy_timeout_ms() -> u64 {
    PoolSettings::default().busy_timeout_ms
}

fn default_acquire_timeout_ms() -> u64 {
    PoolSettings::default().acquire_timeout_ms
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_max_size: default_pool_max_size(),
            pool_min_idle: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Pool settings derived from this configuration.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool_max_size: self.pool_max_size,
            pool_min_idle: self.pool_min_idle,
            busy_timeout_ms: self.busy_timeout_ms,
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
        }
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
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override holds a value of the wrong type.
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv {
        /// The variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `KSEEKERS_DB_PATH` overrides `database.path`
/// - `KSEEKERS_DB_POOL_SIZE` overrides `database.pool_max_size`
/// - `KSEEKERS_DB_POOL_MIN_IDLE` overrides `database.pool_min_idle`
/// - `KSEEKERS_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `KSEEKERS_DB_ACQUIRE_TIMEOUT_MS` overrides `database.acquire_timeout_ms`
/// - `KSEEKERS_MIGRATIONS_DIR` overrides `migrations.dir`
/// - `KSEEKERS_LOG_LEVEL` overrides `logging.level`
/// - `KSEEKERS_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if a numeric override does not parse.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(config, |var| std::env::var(var).ok())
}

fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value })
    }

    if let Some(db_path) = lookup("KSEEKERS_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(size) = lookup("KSEEKERS_DB_POOL_SIZE") {
        config.database.pool_max_size = parsed("KSEEKERS_DB_POOL_SIZE", size)?;
    }
    if let Some(min_idle) = lookup("KSEEKERS_DB_POOL_MIN_IDLE") {
        config.database.pool_min_idle = Some(parsed("KSEEKERS_DB_POOL_MIN_IDLE", min_idle)?);
    }
    if let Some(ms) = lookup("KSEEKERS_DB_BUSY_TIMEOUT_MS") {
        config.database.busy_timeout_ms = parsed("KSEEKERS_DB_BUSY_TIMEOUT_MS", ms)?;
    }
    if let Some(ms) = lookup("KSEEKERS_DB_ACQUIRE_TIMEOUT_MS") {
        config.database.acquire_timeout_ms = parsed("KSEEKERS_DB_ACQUIRE_TIMEOUT_MS", ms)?;
    }
    if let Some(dir) = lookup("KSEEKERS_MIGRATIONS_DIR") {
        config.migrations.dir = PathBuf::from(dir);
    }
    if let Some(level) = lookup("KSEEKERS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("KSEEKERS_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
