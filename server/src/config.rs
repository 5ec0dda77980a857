use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use wheelspin_execution::Templates;
use wheelspin_types::{SpinPolicyConfig, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};

/// Configuration for the [crate::Service], read from YAML.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,

    /// Journal file. Without one, the primary store is in memory.
    #[serde(default)]
    pub journal: Option<String>,
    #[serde(default)]
    pub fallback_to_memory: bool,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Overrides `excludeGuaranteedFromFree` on every template when set.
    #[serde(default)]
    pub exclude_guaranteed_from_free: Option<bool>,
    #[serde(default)]
    pub templates: BTreeMap<String, SpinPolicyConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("history_limit must be at most {max} (got {value})")]
    InvalidHistoryLimit { value: usize, max: usize },
    #[error("template {template} is invalid: {source}")]
    InvalidTemplate {
        template: String,
        #[source]
        source: wheelspin_types::ConfigError,
    },
}

pub struct ValidatedConfig {
    pub port: u16,
    pub log_level: Level,
    pub json_logs: bool,

    pub journal: Option<PathBuf>,
    pub fallback_to_memory: bool,
    pub store_timeout: Duration,

    pub history_limit: usize,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,

    pub rng_seed: Option<u64>,
    pub templates: Templates,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_rate_limit_per_second() -> u64 {
    50
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        non_zero("store_timeout_ms", self.store_timeout_ms)?;
        non_zero("history_limit", self.history_limit as u64)?;
        non_zero("rate_limit_per_second", self.rate_limit_per_second)?;
        non_zero("rate_limit_burst", u64::from(self.rate_limit_burst))?;
        if self.history_limit > MAX_HISTORY_LIMIT {
            return Err(ConfigError::InvalidHistoryLimit {
                value: self.history_limit,
                max: MAX_HISTORY_LIMIT,
            });
        }

        let templates = Templates::with_exclusion_override(self.exclude_guaranteed_from_free)
            .load(self.templates)
            .map_err(|(template, source)| ConfigError::InvalidTemplate { template, source })?;

        Ok(ValidatedConfig {
            port: self.port,
            log_level,
            json_logs: self.json_logs,
            journal: self.journal.map(PathBuf::from),
            fallback_to_memory: self.fallback_to_memory,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            history_limit: self.history_limit,
            rate_limit_per_second: self.rate_limit_per_second,
            rate_limit_burst: self.rate_limit_burst,
            rng_seed: self.rng_seed,
            templates,
        })
    }
}
