//! Runtime configuration.
//!
//! # Responsibility
//! - Hold database, logging, paging and scheduler settings.
//! - Load them from `GRIDBASE_*` environment variables or a JSON document.
//!
//! # Invariants
//! - A loaded `CoreConfig` has passed `validate()`.
//! - `1 <= default_page_size <= max_page_size`.

use crate::logging::normalize_level;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "GRIDBASE_";

/// Configuration loading or validation failure.
#[derive(Debug)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidVar { key: String, message: String },
    /// JSON document is malformed or has unknown fields.
    Json(serde_json::Error),
    /// Values parse but break a constraint.
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidVar { key, message } => write!(f, "invalid `{key}`: {message}"),
            Self::Json(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Default and upper bound for record page sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

impl PageLimits {
    /// Resolves a requested page size into `[1, max_page_size]`.
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub db_path: PathBuf,
    pub log_level: String,
    /// Absolute directory for rolling log files; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    pub scheduler_interval_secs: u64,
    pub scheduler_lease_secs: u64,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let limits = PageLimits::default();
        Self {
            db_path: PathBuf::from("gridbase.sqlite3"),
            log_level: crate::logging::default_log_level().to_string(),
            log_dir: None,
            scheduler_interval_secs: 60,
            scheduler_lease_secs: 300,
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
        }
    }
}

impl CoreConfig {
    /// Reads `GRIDBASE_*` variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(value) = read("DB_PATH") {
            config.db_path = PathBuf::from(value);
        }
        if let Some(value) = read("LOG_LEVEL") {
            config.log_level = value;
        }
        if let Some(value) = read("LOG_DIR") {
            config.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = read("SCHEDULER_INTERVAL_SECS") {
            config.scheduler_interval_secs = parse_var("SCHEDULER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read("SCHEDULER_LEASE_SECS") {
            config.scheduler_lease_secs = parse_var("SCHEDULER_LEASE_SECS", &value)?;
        }
        if let Some(value) = read("DEFAULT_PAGE_SIZE") {
            config.default_page_size = parse_var("DEFAULT_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read("MAX_PAGE_SIZE") {
            config.max_page_size = parse_var("MAX_PAGE_SIZE", &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_level(&self.log_level).map_err(ConfigError::Invalid)?;
        if let Some(dir) = &self.log_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "log_dir must be absolute, got `{}`",
                    dir.display()
                )));
            }
        }
        if self.scheduler_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.scheduler_lease_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler_lease_secs must be at least 1".to_string(),
            ));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(format!(
                "default_page_size {} must be within 1..={}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        }
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn scheduler_lease(&self) -> Duration {
        Duration::from_secs(self.scheduler_lease_secs)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidVar {
        key: format!("{ENV_PREFIX}{name}"),
        message: err.to_string(),
    })
}
