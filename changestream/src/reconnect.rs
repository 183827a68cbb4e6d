//! Retry bookkeeping for participants whose shard becomes unreachable.
//!
//! A participant records every failed read with the [`ReconnectionManager`], sleeps for the
//! returned backoff and retries with the same cursor, which resumes right after the last entry
//! it read. Errors surface to the stream once they are not transient or once the configured
//! number of consecutive attempts is used up.

use std::time::{Duration, Instant};

use config::shared::ReconnectionConfig;
use rand::Rng;

use crate::error::StreamError;

/// Current status of a participant's connection to its shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionStatus {
    Connected,
    Reconnecting {
        /// Consecutive failed attempts so far, starting at 1.
        attempt: u32,
    },
    /// Retries were exhausted or the error was not retryable.
    Failed { reason: String },
}

#[derive(Debug)]
pub struct ReconnectionState {
    pub status: ReconnectionStatus,
    pub attempt_count: u32,
    pub first_failure_time: Option<Instant>,
    pub last_error: Option<StreamError>,
}

impl ReconnectionState {
    pub fn new() -> Self {
        Self {
            status: ReconnectionStatus::Connected,
            attempt_count: 0,
            first_failure_time: None,
            last_error: None,
        }
    }

    pub fn record_failure(&mut self, error: StreamError) {
        if self.first_failure_time.is_none() {
            self.first_failure_time = Some(Instant::now());
        }
        self.attempt_count += 1;
        self.last_error = Some(error);
        self.status = ReconnectionStatus::Reconnecting {
            attempt: self.attempt_count,
        };
    }

    pub fn record_success(&mut self) {
        self.status = ReconnectionStatus::Connected;
        self.attempt_count = 0;
        self.first_failure_time = None;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.status = ReconnectionStatus::Failed { reason };
    }

    pub fn elapsed_since_first_failure(&self) -> Option<Duration> {
        self.first_failure_time.map(|t| t.elapsed())
    }
}

impl Default for ReconnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether and when a failed shard read is retried.
#[derive(Debug)]
pub struct ReconnectionManager {
    config: ReconnectionConfig,
    state: ReconnectionState,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            state: ReconnectionState::new(),
        }
    }

    pub fn state(&self) -> &ReconnectionState {
        &self.state
    }

    /// Returns `true` if reconnection is enabled, `error` is transient and attempts remain.
    pub fn should_retry(&self, error: &StreamError) -> bool {
        if !self.config.enabled {
            return false;
        }

        if !error.kind().is_transient() {
            return false;
        }

        !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.attempt_count >= self.config.max_attempts
    }

    /// Backoff before the next attempt.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at the maximum delay, plus up to 30%
    /// random jitter so that participants of many streams do not retry in lockstep.
    pub fn calculate_backoff(&self) -> Duration {
        let attempt = self.state.attempt_count.saturating_sub(1);
        let multiplier = self.config.backoff_multiplier.powi(attempt as i32);
        let base_delay_ms = self.config.initial_retry_delay_ms as f64 * multiplier;

        let capped_delay_ms = base_delay_ms.min(self.config.max_retry_delay_ms as f64);

        let jitter_factor = rand::rng().random::<f64>() * 0.3;
        let jittered_delay_ms = capped_delay_ms * (1.0 + jitter_factor);

        Duration::from_millis(jittered_delay_ms as u64)
    }

    pub fn record_failure(&mut self, error: StreamError) {
        self.state.record_failure(error);
    }

    pub fn record_success(&mut self) {
        self.state.record_success();
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.state.mark_failed(reason);
    }

    pub fn total_retry_duration(&self) -> Option<Duration> {
        self.state.elapsed_since_first_failure()
    }

    pub fn attempt_count(&self) -> u32 {
        self.state.attempt_count
    }
}
