//! Application configuration loaded from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use saga::{CoordinatorConfig, DefinitionDocument};
use thiserror::Error;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: Postgres connection string; in-memory stores when unset
/// - `SAGA_DEFINITIONS`: path to a JSON array of saga definitions
/// - `SAGA_CALL_TIMEOUT_MS`, `SAGA_SWEEP_INTERVAL_MS`, `SAGA_SNAPSHOT_INTERVAL`:
///   coordinator tuning
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub definitions_path: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let mut coordinator = defaults.coordinator.clone();
        if let Some(call_timeout) = millis("SAGA_CALL_TIMEOUT_MS") {
            coordinator = coordinator.with_call_timeout(call_timeout);
        }
        if let Some(sweep_interval) = millis("SAGA_SWEEP_INTERVAL_MS") {
            coordinator = coordinator.with_sweep_interval(sweep_interval);
        }
        if let Some(interval) = lookup("SAGA_SNAPSHOT_INTERVAL").and_then(|v| v.parse().ok()) {
            coordinator = coordinator.with_snapshot_interval(interval);
        }

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            definitions_path: lookup("SAGA_DEFINITIONS").map(PathBuf::from),
            coordinator,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reads the definitions file, if one is configured.
    pub fn load_definitions(&self) -> Result<Vec<DefinitionDocument>, ConfigError> {
        match &self.definitions_path {
            Some(path) => read_definitions(path),
            None => Ok(Vec::new()),
        }
    }
}

fn read_definitions(path: &Path) -> Result<Vec<DefinitionDocument>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            definitions_path: None,
            coordinator: CoordinatorConfig::default(),
        }
    }
}
