use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of topology change polling.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TopologyConfig {
    /// Interval between two polls of the cluster topology.
    ///
    /// Default: 100
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl TopologyConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::invalid("topology.poll_interval_ms", "must be > 0"));
        }

        Ok(())
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    TopologyConfig::DEFAULT_POLL_INTERVAL_MS
}
