//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SchedulerError;

/// Length of the sliding window used by the throughput cap.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry budget for jobs which do not set their own
    #[serde(default = "default_max_retries")]
    pub max_retries: u16,

    /// Upper bound on how long the worker loop waits while admission is denied
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Admission control settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max jobs processing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Max admissions within any trailing [`RATE_WINDOW`]
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,

    /// Pause after each admission before the next one is attempted
    #[serde(default = "default_delay_between_ms")]
    pub delay_between_ms: u64,
}

/// A partial update of [`RateLimitConfig`], fields left as [`None`] are unchanged.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitUpdate {
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub max_per_minute: Option<u32>,
    #[serde(default)]
    pub delay_between_ms: Option<u64>,
}

fn default_max_retries() -> u16 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_per_minute() -> u32 {
    15
}

fn default_delay_between_ms() -> u64 {
    2_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_per_minute: default_max_per_minute(),
            delay_between_ms: default_delay_between_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_rate_limit(self, rate_limit: RateLimitConfig) -> Self {
        Self { rate_limit, ..self }
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.rate_limit.validate()
    }
}

impl RateLimitConfig {
    pub fn delay_between(&self) -> Duration {
        Duration::from_millis(self.delay_between_ms)
    }

    /// Returns the configuration resulting from applying `update`.
    pub fn merge(&self, update: &RateLimitUpdate) -> Self {
        Self {
            max_concurrent: update.max_concurrent.unwrap_or(self.max_concurrent),
            max_per_minute: update.max_per_minute.unwrap_or(self.max_per_minute),
            delay_between_ms: update.delay_between_ms.unwrap_or(self.delay_between_ms),
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConfig {
                reason: "max_concurrent must be at least 1".to_owned(),
            });
        }
        if self.max_per_minute == 0 {
            return Err(SchedulerError::InvalidConfig {
                reason: "max_per_minute must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}
