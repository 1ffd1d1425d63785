//! Manager configuration.
//!
//! Every field has a default, so a partial TOML/JSON document (or none at all) is a valid
//! config. Per-type settings on a `TaskDefinition` override the defaults here.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Jitter, RetryPolicy};
use crate::typed::TaskDefaults;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("retry.multiplier must be at least 1.0")]
    Multiplier,

    #[error("retry.max_delay_ms must not be below retry.base_delay_ms")]
    DelayRange,
}

// ── Top-level config ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// How often the polling lifecycle runs a claim cycle.
    pub poll_interval_ms: u64,

    /// Persisted tasks this instance runs at once.
    pub max_workers: usize,

    /// Retry limit for types that don't set their own.
    pub default_max_attempts: u32,

    /// Runner timeout for types that don't set their own.
    pub default_timeout_ms: u64,

    /// Ring buffer size of the event stream. Subscribers lagging further behind
    /// skip events.
    pub event_buffer_capacity: usize,

    pub retry: RetryConfig,

    pub ephemeral: EphemeralConfig,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            max_workers: 10,
            default_max_attempts: 3,
            default_timeout_ms: 5 * 60 * 1_000,
            event_buffer_capacity: 1_024,
            retry: RetryConfig::default(),
            ephemeral: EphemeralConfig::default(),
        }
    }
}

impl TaskManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// What a `TaskDefinition` falls back to for settings it leaves unset.
    pub fn task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            max_attempts: self.default_max_attempts,
            timeout: self.default_timeout(),
            retry: self.retry.policy(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("max_workers", self.max_workers == 0),
            ("default_timeout_ms", self.default_timeout_ms == 0),
            ("event_buffer_capacity", self.event_buffer_capacity == 0),
            ("ephemeral.request_capacity", self.ephemeral.request_capacity == 0),
            ("ephemeral.max_workers", self.ephemeral.max_workers == 0),
        ];
        if let Some(&(field, _)) = non_zero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Zero { field });
        }
        self.retry.validate()
    }
}

// ── Section configs ─────────────────────────────────────────────────

/// Manager-wide backoff for failed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Zero {
                field: "retry.base_delay_ms",
            });
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Multiplier);
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::DelayRange);
        }
        Ok(())
    }
}

/// The in-memory lane for tasks that are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
    pub enabled: bool,

    /// Tasks waiting for a worker. Offers beyond this are rejected.
    pub request_capacity: usize,

    /// Ephemeral tasks running at once. Independent of `max_workers`.
    pub max_workers: usize,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_capacity: 10,
            max_workers: 10,
        }
    }
}
