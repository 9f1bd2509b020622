use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::LifecycleError, retry::BackoffPolicy};

pub const DEFAULT_AUTH_PATH: &str = "./.relink-store/session.json";
pub const DEFAULT_BACKUP_LOCATION: &str = "./.relink-store/backups";

/// Every tunable knob of the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub auth_storage_location: PathBuf,
    /// Backup directories in priority order.
    pub backup_locations: Vec<PathBuf>,
    pub backup_interval_ms: u64,
    pub backup_retention_count: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_max_ms: u64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub pairing_timeout_ms: u64,
    pub health_probe_interval_ms: u64,
    pub health_failure_threshold: u32,
    pub health_window_size: usize,
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auth_storage_location: PathBuf::from(DEFAULT_AUTH_PATH),
            backup_locations: vec![PathBuf::from(DEFAULT_BACKUP_LOCATION)],
            backup_interval_ms: 300_000,
            backup_retention_count: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_max_ms: 1_000,
            max_retries: None,
            pairing_timeout_ms: 30_000,
            health_probe_interval_ms: 30_000,
            health_failure_threshold: 3,
            health_window_size: 16,
            connect_timeout_ms: 20_000,
            probe_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
        }
    }
}

impl LifecycleConfig {
    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(LifecycleError::invalid_config(
                "backoff_factor",
                format!("must be a finite number >= 1, got {}", self.backoff_factor),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(LifecycleError::invalid_config(
                "base_delay_ms",
                "must be greater than zero",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(LifecycleError::invalid_config(
                "max_delay_ms",
                format!(
                    "{} is below base_delay_ms {}",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }
        if self.health_failure_threshold == 0 {
            return Err(LifecycleError::invalid_config(
                "health_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.health_window_size < self.health_failure_threshold as usize {
            return Err(LifecycleError::invalid_config(
                "health_window_size",
                "must hold at least health_failure_threshold samples",
            ));
        }
        if self.backup_locations.is_empty() {
            return Err(LifecycleError::invalid_config(
                "backup_locations",
                "at least one location is required",
            ));
        }

        let positive = [
            ("backup_interval_ms", self.backup_interval_ms),
            ("pairing_timeout_ms", self.pairing_timeout_ms),
            ("health_probe_interval_ms", self.health_probe_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(LifecycleError::invalid_config(key, "must be greater than zero"));
        }

        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.base_delay_ms,
            self.max_delay_ms,
            self.backoff_factor,
            self.jitter_max_ms,
        )
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
