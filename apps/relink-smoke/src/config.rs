//! Environment-backed configuration for `relink-smoke`.

use std::{env, error::Error, fmt, path::PathBuf, str::FromStr};

use relink_core::{LifecycleConfig, LifecycleError};

/// Runtime configuration used by the smoke runner.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Lifecycle tuning forwarded to the runtime.
    pub lifecycle: LifecycleConfig,
    /// When set, the loopback gateway approves pairing this long after a challenge.
    pub auto_pair_after_ms: Option<u64>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = LifecycleConfig::default();

        let auth_storage_location = optional_trimmed_env("RELINK_AUTH_PATH", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or(defaults.auth_storage_location);
        let backup_locations = match optional_trimmed_env("RELINK_BACKUP_LOCATIONS", &mut lookup)
        {
            Some(value) => split_locations(&value),
            None => defaults.backup_locations,
        };
        let max_retries = match optional_trimmed_env("RELINK_MAX_RETRIES", &mut lookup) {
            None => defaults.max_retries,
            Some(value) if value.eq_ignore_ascii_case("unbounded") => None,
            Some(value) => Some(parse_value("RELINK_MAX_RETRIES", value)?),
        };

        let lifecycle = LifecycleConfig {
            auth_storage_location,
            backup_locations,
            backup_interval_ms: parse_or(
                "RELINK_BACKUP_INTERVAL_MS",
                defaults.backup_interval_ms,
                &mut lookup,
            )?,
            backup_retention_count: parse_or(
                "RELINK_BACKUP_RETENTION",
                defaults.backup_retention_count,
                &mut lookup,
            )?,
            base_delay_ms: parse_or("RELINK_BASE_DELAY_MS", defaults.base_delay_ms, &mut lookup)?,
            max_delay_ms: parse_or("RELINK_MAX_DELAY_MS", defaults.max_delay_ms, &mut lookup)?,
            backoff_factor: parse_or(
                "RELINK_BACKOFF_FACTOR",
                defaults.backoff_factor,
                &mut lookup,
            )?,
            jitter_max_ms: parse_or("RELINK_JITTER_MAX_MS", defaults.jitter_max_ms, &mut lookup)?,
            max_retries,
            pairing_timeout_ms: parse_or(
                "RELINK_PAIRING_TIMEOUT_MS",
                defaults.pairing_timeout_ms,
                &mut lookup,
            )?,
            health_probe_interval_ms: parse_or(
                "RELINK_HEALTH_PROBE_INTERVAL_MS",
                defaults.health_probe_interval_ms,
                &mut lookup,
            )?,
            health_failure_threshold: parse_or(
                "RELINK_HEALTH_FAILURE_THRESHOLD",
                defaults.health_failure_threshold,
                &mut lookup,
            )?,
            health_window_size: defaults.health_window_size,
            connect_timeout_ms: parse_or(
                "RELINK_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
                &mut lookup,
            )?,
            probe_timeout_ms: parse_or(
                "RELINK_PROBE_TIMEOUT_MS",
                defaults.probe_timeout_ms,
                &mut lookup,
            )?,
            close_timeout_ms: parse_or(
                "RELINK_CLOSE_TIMEOUT_MS",
                defaults.close_timeout_ms,
                &mut lookup,
            )?,
        };
        lifecycle.validate().map_err(ConfigError::Rejected)?;

        let auto_pair_after_ms = optional_trimmed_env("RELINK_AUTO_PAIR_MS", &mut lookup)
            .map(|value| parse_value("RELINK_AUTO_PAIR_MS", value))
            .transpose()?;

        Ok(Self {
            lifecycle,
            auto_pair_after_ms,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// Values parsed but the combination is not usable.
    Rejected(LifecycleError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
            Self::Rejected(err) => write!(f, "invalid configuration: {}", err.message),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_value<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    match optional_trimmed_env(key, lookup) {
        Some(value) => parse_value(key, value),
        None => Ok(default),
    }
}

fn split_locations(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}
