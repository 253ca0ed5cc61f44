//! Configuration loading.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (explicit `--config` path, or `syncbridge.toml` when present)
//! 3. environment variables prefixed `SYNCBRIDGE`, with `__` between nested
//!    keys, e.g. `SYNCBRIDGE_SERVER__PORT=9090`

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogLevel;
use crate::webhooks::RetryPolicy;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "syncbridge.toml";

const ENV_PREFIX: &str = "SYNCBRIDGE";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// A source could not be read or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// Values parsed but are not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// When set, every `/api` route requires `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            auth_token: None,
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 3,
            request_timeout_ms: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    /// JSON-lines file for sync log entries. In-memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub dispatcher: DispatcherConfig,
    pub log_store: LogStoreConfig,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load from defaults, the config file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is given but missing, a source cannot be
    /// parsed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.display().to_string()));
                }
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                builder = builder.add_source(
                    File::with_name(DEFAULT_CONFIG_FILE)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    /// Parse a TOML document on top of the defaults, without the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?;
        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.base_delay_ms > self.dispatcher.max_delay_ms {
            return Err(ConfigError::Invalid(
                "dispatcher.base_delay_ms cannot exceed dispatcher.max_delay_ms".to_string(),
            ));
        }
        if self.dispatcher.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.request_timeout_ms must be positive".to_string(),
            ));
        }
        if matches!(&self.server.auth_token, Some(token) if token.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "server.auth_token cannot be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Render as TOML with the auth token masked.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.server.auth_token.is_some() {
            shown.server.auth_token = Some("<redacted>".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert!(config.log_store.path.is_none());
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.listen_address(), "127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            port = 9000
            auth_token = "s3cret"

            [dispatcher]
            max_attempts = 5

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.dispatcher.max_attempts, 5);
        assert_eq!(config.dispatcher.base_delay_ms, 500);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::from_toml_str("[dispatcher]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = AppConfig::from_toml_str("[dispatcher]\nbase_delay_ms = 60000\n").unwrap_err();
        assert!(err.to_string().contains("base_delay_ms"));

        assert!(AppConfig::from_toml_str("[server]\nport = \"eighty\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[log_store]\npath = \"/tmp/sync.jsonl\"").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.log_store.path.as_deref(),
            Some(Path::new("/tmp/sync.jsonl"))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/syncbridge.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_redacted_toml() {
        let mut config = AppConfig::default();
        config.server.auth_token = Some("s3cret".to_string());

        let rendered = config.to_redacted_toml().unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cret"));
    }
}
