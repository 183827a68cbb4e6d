use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::LogicalTimestamp;

/// Timestamp the clock of a fresh cluster reports before the first write.
pub const INITIAL_CLUSTER_TIME: LogicalTimestamp = LogicalTimestamp::new(1, 0);

/// Monotonic logical clock shared by every shard of a cluster.
///
/// Each commit obtains its cluster time from [`ClusterClock::tick`], so timestamps are
/// unique per commit and strictly increasing in commit order.
#[derive(Debug, Clone)]
pub struct ClusterClock {
    inner: Arc<Mutex<LogicalTimestamp>>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::starting_at(INITIAL_CLUSTER_TIME)
    }

    pub fn starting_at(start: LogicalTimestamp) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    /// Returns the last timestamp handed out.
    pub fn now(&self) -> LogicalTimestamp {
        *self.lock()
    }

    /// Advances the clock and returns the new timestamp.
    pub fn tick(&self) -> LogicalTimestamp {
        let mut now = self.lock();
        *now = now.successor();
        *now
    }

    fn lock(&self) -> MutexGuard<'_, LogicalTimestamp> {
        // The guarded value is a plain timestamp, a poisoned lock still holds a valid one.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ClusterClock {
    fn default() -> Self {
        Self::new()
    }
}
