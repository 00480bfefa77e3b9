use crate::core::db::connection::ConnectionSettings;
use crate::core::db::pool::{
    ConnectionPool, PoolConfig, DEFAULT_CHECKOUT_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_INITIAL_CONNECTIONS,
    DEFAULT_MAX_CONNECTIONS,
};
use crate::core::url::Url;
use crate::core::{DbError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolSection,
    pub connection: ConnectionSettings,
}

/// Pool-related configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub url: Option<String>,
    pub initial_connections: usize,
    pub max_connections: usize,
    pub connection_timeout_secs: u64,
    pub checkout_timeout_secs: u64,
    /// Reaper sweep interval; the reaper is off when absent
    pub reaper_interval_secs: Option<u64>,
}

impl Default for PoolSection {
    fn default() -> Self {
        PoolSection {
            url: None,
            initial_connections: DEFAULT_INITIAL_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT.as_secs(),
            checkout_timeout_secs: DEFAULT_CHECKOUT_TIMEOUT.as_secs(),
            reaper_interval_secs: None,
        }
    }
}

impl Config {
    /// Parses configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    /// The pool settings described by this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            initial_connections: self.pool.initial_connections,
            max_connections: self.pool.max_connections,
            connection_timeout: Duration::from_secs(self.pool.connection_timeout_secs),
            checkout_timeout: Duration::from_secs(self.pool.checkout_timeout_secs),
            reaper_interval: self.pool.reaper_interval_secs.map(Duration::from_secs),
            connection: self.connection.clone(),
        }
    }

    /// Parses the configured database URL.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` if no URL is configured and
    /// `DbError::Parse` if it is malformed.
    pub fn url(&self) -> Result<Url> {
        let url = self
            .pool
            .url
            .as_deref()
            .ok_or_else(|| DbError::Config("no database url configured under [pool]".to_string()))?;
        Url::parse(url)
    }

    /// Creates a stopped pool for the configured URL and settings.
    pub fn build_pool(&self) -> Result<ConnectionPool> {
        let config = self.pool_config();
        config.validate()?;
        ConnectionPool::with_config(self.url()?, config)
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```no_run
/// let config = dbkit::config::load_config("dbkit.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    debug!("loading configuration from {}", path.display());
    let content = fs::read_to_string(path)?;
    Config::from_toml_str(&content)
}

/// Location of the per-user configuration file, `<config dir>/dbkit/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dbkit").join("config.toml"))
}
