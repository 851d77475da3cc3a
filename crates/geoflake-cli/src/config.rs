//! Configuration for the geoflake binary
//!
//! Loads configuration from:
//! 1. config.yaml - engine tuning, logging, named connections
//! 2. .env file - secrets (connection passwords)
//!
//! Environment variables always override config.yaml values.

use geoflake_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Parameters of one named connection (`kind`, `path`, `schema`, ...).
pub type ConnectionParams = BTreeMap<String, String>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub connections: BTreeMap<String, ConnectionParams>,
}

impl Config {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], falling back to defaults when the file is absent.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("GEOFLAKE_BATCH_SIZE") {
            self.engine.batch_size = n;
        }
        if let Some(n) = env_parse("GEOFLAKE_GEOMETRY_ROW_CAP") {
            self.engine.geometry_row_cap = n;
        }
        if let Some(n) = env_parse("GEOFLAKE_CELL_ROW_CAP") {
            self.engine.cell_row_cap = n;
        }
        if let Some(n) = env_parse("GEOFLAKE_PREVIEW_LIMIT") {
            self.engine.preview_limit = n;
        }
        if let Ok(marker) = std::env::var("GEOFLAKE_CELL_MARKER") {
            self.engine.cell_marker = marker;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
    }

    /// Parameters of a named connection.
    ///
    /// The password never comes from config.yaml: it is read from
    /// `GEOFLAKE_<NAME>_PASSWORD` (usually set in .env).
    pub fn connection(&self, name: &str) -> Result<ConnectionParams, ConfigError> {
        let mut params = self
            .connections
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownConnection(name.to_string()))?;
        params.remove("password");
        if let Ok(password) = std::env::var(password_var(name)) {
            params.insert("password".to_string(), password);
        }
        Ok(params)
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn password_var(connection: &str) -> String {
    let name: String = connection
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("GEOFLAKE_{name}_PASSWORD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.batch_size, 5000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.output, "stdout");
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_load_with_overrides_and_secrets() {
        std::env::set_var("GEOFLAKE_BATCH_SIZE", "250");
        std::env::set_var("GEOFLAKE_LOCAL_DEV_PASSWORD", "from-env");

        let config_yaml = r#"
engine:
  cell_row_cap: 1000
connections:
  local-dev:
    kind: duckdb
    path: ./dev.duckdb
    password: ignored
"#;
        let temp_file = std::env::temp_dir().join("geoflake_test_config.yaml");
        std::fs::write(&temp_file, config_yaml).unwrap();

        let config = Config::load(&temp_file).unwrap();
        assert_eq!(config.engine.batch_size, 250); // Overridden
        assert_eq!(config.engine.cell_row_cap, 1000);
        assert_eq!(config.engine.geometry_row_cap, 50_000);

        let params = config.connection("local-dev").unwrap();
        assert_eq!(params.get("kind").map(String::as_str), Some("duckdb"));
        assert_eq!(params.get("password").map(String::as_str), Some("from-env"));
        assert!(matches!(
            config.connection("prod"),
            Err(ConfigError::UnknownConnection(_))
        ));

        std::env::remove_var("GEOFLAKE_BATCH_SIZE");
        std::env::remove_var("GEOFLAKE_LOCAL_DEV_PASSWORD");
        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_password_var_name() {
        assert_eq!(password_var("local-dev"), "GEOFLAKE_LOCAL_DEV_PASSWORD");
    }
}
