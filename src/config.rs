//! Configuration loader for the `sentinel-audit` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Nothing is required; every value has a default
//! suitable for running from the directory that holds the site databases.
//!
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::store::StoreOptions;

/// Parse an optional integer variable with a default value.
macro_rules! parse_env_u32 {
    ($lookup:ident, $var_name:expr, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Read an optional string variable, treating blank as unset.
macro_rules! env_or {
    ($lookup:ident, $var_name:expr, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| $default.to_string())
    };
}

pub const DEFAULT_LOG_FILE: &str = "sentinel_audit_log.txt";

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Directory holding the site registry, site databases and the log.
    pub data_dir: PathBuf,

    /// HTTP listen address.
    pub bind_addr: SocketAddr,

    /// Maximum number of connections per site pool.
    pub db_pool_max: u32,

    /// How long to wait on a locked site database.
    pub db_busy_timeout_secs: u32,

    /// Window used when a request gives no date range.
    pub default_range_days: u32,

    /// Append-only log file; relative paths are under `data_dir`.
    pub log_file: PathBuf,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `SENTINEL_DATA_DIR` – data directory (default: `.`)
/// - `SENTINEL_BIND_ADDR` – listen address (default: `0.0.0.0:8080`)
/// - `DB_POOL_MAX` – max connections per site (default: 1)
/// - `DB_BUSY_TIMEOUT_SECS` – lock wait in seconds (default: 10)
/// - `DEFAULT_RANGE_DAYS` – default dashboard window (default: 30)
/// - `SENTINEL_LOG_FILE` – log file (default: `sentinel_audit_log.txt`)
///
/// Returns an error if any variable is present but malformed.
pub fn load_from_env() -> Result<Config> {
    load_with(|name| env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
pub fn load_with<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let data_dir = PathBuf::from(env_or!(lookup, "SENTINEL_DATA_DIR", "."));
    let bind_addr = env_or!(lookup, "SENTINEL_BIND_ADDR", "0.0.0.0:8080")
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("Invalid SENTINEL_BIND_ADDR: {}", e))?;
    let db_pool_max = parse_env_u32!(lookup, "DB_POOL_MAX", 1);
    let db_busy_timeout_secs = parse_env_u32!(lookup, "DB_BUSY_TIMEOUT_SECS", 10);
    let default_range_days = parse_env_u32!(lookup, "DEFAULT_RANGE_DAYS", 30);
    let log_file = PathBuf::from(env_or!(lookup, "SENTINEL_LOG_FILE", DEFAULT_LOG_FILE));

    if db_pool_max == 0 {
        return Err(anyhow!("Invalid DB_POOL_MAX: must be at least 1"));
    }

    Ok(Config {
        data_dir,
        bind_addr,
        db_pool_max,
        db_busy_timeout_secs,
        default_range_days,
        log_file,
    })
}

impl Config {
    // ---
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_secs(u64::from(self.db_busy_timeout_secs)),
            pool_max: self.db_pool_max,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        if self.log_file.is_absolute() {
            self.log_file.clone()
        } else {
            self.data_dir.join(&self.log_file)
        }
    }

    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  SENTINEL_DATA_DIR    : {}", self.data_dir.display());
        tracing::info!("  SENTINEL_BIND_ADDR   : {}", self.bind_addr);
        tracing::info!("  DB_POOL_MAX          : {}", self.db_pool_max);
        tracing::info!("  DB_BUSY_TIMEOUT_SECS : {}", self.db_busy_timeout_secs);
        tracing::info!("  DEFAULT_RANGE_DAYS   : {}", self.default_range_days);
        tracing::info!("  SENTINEL_LOG_FILE    : {}", self.log_path().display());
    }
}
