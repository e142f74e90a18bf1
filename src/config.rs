//! Engine configuration.
//!
//! Stored as an optional JSON file on disk; every field has a default:
//! ```json
//! {
//!   "chunk_size": 500,
//!   "retry": { "max_attempts": 5, "initial_delay_ms": 100, "max_delay_ms": 5000 },
//!   "legacy_subject_code": "CIV"
//! }
//! ```
//! `EXAM_RANKER_*` environment variables override file values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CHUNK_SIZE_ENV: &str = "EXAM_RANKER_CHUNK_SIZE";
pub const MAX_ATTEMPTS_ENV: &str = "EXAM_RANKER_MAX_ATTEMPTS";
pub const LEGACY_SUBJECT_ENV: &str = "EXAM_RANKER_LEGACY_SUBJECT";
pub const DB_ENV: &str = "EXAM_RANKER_DB";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{name}={value} is not valid: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per write transaction.
    pub chunk_size: usize,
    pub retry: RetryConfig,
    /// Subject whose presence marks an exam as following the legacy
    /// curriculum. Exam settings take precedence.
    pub legacy_subject_code: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            retry: RetryConfig::default(),
            legacy_subject_code: None,
        }
    }
}

impl EngineConfig {
    /// Loads the config from a JSON file at `path`, applies environment
    /// overrides and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up through `var` and validates.
    pub fn with_env_overrides(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = var(CHUNK_SIZE_ENV) {
            self.chunk_size = parse_env(CHUNK_SIZE_ENV, &value)?;
        }
        if let Some(value) = var(MAX_ATTEMPTS_ENV) {
            self.retry.max_attempts = parse_env(MAX_ATTEMPTS_ENV, &value)?;
        }
        if let Some(value) = var(LEGACY_SUBJECT_ENV) {
            let value = value.trim();
            self.legacy_subject_code = (!value.is_empty()).then(|| value.to_string());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms must be at least 1".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
}
