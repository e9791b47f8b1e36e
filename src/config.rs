//! Configuration for the knitcore binary and library.
//!
//! Settings come either from environment variables ([`CoreConfig::from_env`])
//! or from a YAML file ([`CoreConfig::from_yaml_file`]). Both paths end in
//! [`CoreConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::naming::{check_dns_label, DEFAULT_VOLUME_PREFIX, DEFAULT_WORKER_PREFIX};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    #[serde(with = "seconds", rename = "acquire_timeout_secs")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Prefixes of derived object names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub volume_prefix: String,
    pub worker_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            volume_prefix: DEFAULT_VOLUME_PREFIX.to_string(),
            worker_prefix: DEFAULT_WORKER_PREFIX.to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub naming: NamingConfig,
    /// Lease given to a freshly created pseudo run.
    #[serde(with = "seconds", rename = "pseudo_lifecycle_suspend_secs")]
    pub pseudo_lifecycle_suspend: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            naming: NamingConfig::default(),
            pseudo_lifecycle_suspend: Duration::ZERO,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `KNITCORE_DB_MAX_CONNECTIONS`: Pool size limit (default: 10)
    /// - `KNITCORE_DB_MIN_CONNECTIONS`: Idle connections kept (default: 1)
    /// - `KNITCORE_DB_ACQUIRE_TIMEOUT_SECS`: Connection acquire timeout (default: 30)
    /// - `KNITCORE_VOLUME_PREFIX`: Volume name prefix (default: data-knitid-)
    /// - `KNITCORE_WORKER_PREFIX`: Worker name prefix (default: worker-run-)
    /// - `KNITCORE_PSEUDO_SUSPEND_SECS`: Pseudo run lease (default: 0)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database.url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Overrides settings with the optional `KNITCORE_*` variables that are set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("KNITCORE_DB_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env_value(&val, "KNITCORE_DB_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("KNITCORE_DB_MIN_CONNECTIONS") {
            self.database.min_connections =
                parse_env_value(&val, "KNITCORE_DB_MIN_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("KNITCORE_DB_ACQUIRE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "KNITCORE_DB_ACQUIRE_TIMEOUT_SECS")?;
            self.database.acquire_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("KNITCORE_VOLUME_PREFIX") {
            self.naming.volume_prefix = val;
        }

        if let Ok(val) = std::env::var("KNITCORE_WORKER_PREFIX") {
            self.naming.worker_prefix = val;
        }

        if let Ok(val) = std::env::var("KNITCORE_PSEUDO_SUSPEND_SECS") {
            let secs: u64 = parse_env_value(&val, "KNITCORE_PSEUDO_SUSPEND_SECS")?;
            self.pseudo_lifecycle_suspend = Duration::from_secs(secs);
        }

        Ok(())
    }

    /// Loads and validates configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::read_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file without validating it. Missing keys take their defaults.
    pub fn read_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database.url cannot be empty".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::ValidationFailed(
                "database.min_connections cannot exceed database.max_connections".to_string(),
            ));
        }

        if self.database.acquire_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "database.acquire_timeout must be greater than 0".to_string(),
            ));
        }

        // A prefix must itself start a valid name; the id completes it.
        for (key, prefix) in [
            ("naming.volume_prefix", &self.naming.volume_prefix),
            ("naming.worker_prefix", &self.naming.worker_prefix),
        ] {
            if let Err(reason) = check_dns_label(&format!("{}x", prefix)) {
                return Err(ConfigError::ValidationFailed(format!("{}: {}", key, reason)));
            }
        }

        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = url.into();
        self
    }

    pub fn with_naming(mut self, volume_prefix: &str, worker_prefix: &str) -> Self {
        self.naming.volume_prefix = volume_prefix.to_string();
        self.naming.worker_prefix = worker_prefix.to_string();
        self
    }

    pub fn with_pseudo_lifecycle_suspend(mut self, suspend: Duration) -> Self {
        self.pseudo_lifecycle_suspend = suspend;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Whole-second durations.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
