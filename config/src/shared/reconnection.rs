use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry policy applied when a participant loses its shard connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Whether transient shard errors are retried.
    ///
    /// When disabled the first connection error surfaces to the consumer.
    /// Default: true
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay before the first retry.
    ///
    /// Default: 100ms
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Upper bound of the backoff delay.
    ///
    /// Default: 5000ms
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Factor applied to the delay after each failed attempt. Must be >= 1.0.
    ///
    /// Default: 2.0
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Number of consecutive failed attempts after which the error surfaces.
    ///
    /// Default: 10
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectionConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ValidationError::invalid(
                "reconnection.backoff_multiplier",
                "must be >= 1.0",
            ));
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err(ValidationError::invalid(
                "reconnection.initial_retry_delay_ms",
                "must be <= max_retry_delay_ms",
            ));
        }

        if self.enabled && self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                "reconnection.max_attempts",
                "must be > 0 when reconnection is enabled",
            ));
        }

        Ok(())
    }
}
