use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of the cross-shard merger and its participant tasks.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MergerConfig {
    /// Longest a participant blocks on a single shard read before reporting a heartbeat.
    ///
    /// Default: 50
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time without data or heartbeat after which a participant is considered lagging.
    ///
    /// Default: 1000
    #[serde(default = "default_lag_threshold_ms")]
    pub lag_threshold_ms: u64,

    /// Time a stream may wait on a lagging participant before failing with a stall error.
    ///
    /// `None` waits indefinitely. Default: `None`
    #[serde(default)]
    pub max_stall_ms: Option<u64>,

    /// Capacity of the channel between a participant task and the merger.
    ///
    /// Default: 256
    #[serde(default = "default_participant_buffer_size")]
    pub participant_buffer_size: usize,

    /// Maximum number of log entries fetched per shard read.
    ///
    /// Default: 128
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// How long a participant whose shard was removed keeps draining before it is dropped.
    ///
    /// Default: 1000
    #[serde(default = "default_removed_shard_grace_ms")]
    pub removed_shard_grace_ms: u64,
}

impl MergerConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

    pub const DEFAULT_LAG_THRESHOLD_MS: u64 = 1_000;

    pub const DEFAULT_PARTICIPANT_BUFFER_SIZE: usize = 256;

    pub const DEFAULT_READ_BATCH_SIZE: usize = 128;

    pub const DEFAULT_REMOVED_SHARD_GRACE_MS: u64 = 1_000;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lag_threshold(&self) -> Duration {
        Duration::from_millis(self.lag_threshold_ms)
    }

    pub fn max_stall(&self) -> Option<Duration> {
        self.max_stall_ms.map(Duration::from_millis)
    }

    pub fn removed_shard_grace(&self) -> Duration {
        Duration::from_millis(self.removed_shard_grace_ms)
    }

    /// Validates the merger configuration.
    ///
    /// Sizes and intervals must be positive and a stall bound, if set, must not be shorter
    /// than the lag threshold.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::invalid("merger.poll_interval_ms", "must be > 0"));
        }

        if self.participant_buffer_size == 0 {
            return Err(ValidationError::invalid(
                "merger.participant_buffer_size",
                "must be > 0",
            ));
        }

        if self.read_batch_size == 0 {
            return Err(ValidationError::invalid("merger.read_batch_size", "must be > 0"));
        }

        if let Some(max_stall_ms) = self.max_stall_ms
            && max_stall_ms < self.lag_threshold_ms
        {
            return Err(ValidationError::invalid(
                "merger.max_stall_ms",
                "must be >= lag_threshold_ms",
            ));
        }

        Ok(())
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            lag_threshold_ms: Self::DEFAULT_LAG_THRESHOLD_MS,
            max_stall_ms: None,
            participant_buffer_size: Self::DEFAULT_PARTICIPANT_BUFFER_SIZE,
            read_batch_size: Self::DEFAULT_READ_BATCH_SIZE,
            removed_shard_grace_ms: Self::DEFAULT_REMOVED_SHARD_GRACE_MS,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    MergerConfig::DEFAULT_POLL_INTERVAL_MS
}

fn default_lag_threshold_ms() -> u64 {
    MergerConfig::DEFAULT_LAG_THRESHOLD_MS
}

fn default_participant_buffer_size() -> usize {
    MergerConfig::DEFAULT_PARTICIPANT_BUFFER_SIZE
}

fn default_read_batch_size() -> usize {
    MergerConfig::DEFAULT_READ_BATCH_SIZE
}

fn default_removed_shard_grace_ms() -> u64 {
    MergerConfig::DEFAULT_REMOVED_SHARD_GRACE_MS
}
