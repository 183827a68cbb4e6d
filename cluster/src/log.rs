use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::ClusterClock;
use crate::error::ClusterError;
use crate::types::{LogPosition, LogicalTimestamp, Namespace, ShardId};

/// A write recorded in a shard log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LogOperation {
    Insert {
        namespace: Namespace,
        document: Value,
    },
    Update {
        namespace: Namespace,
        document_key: Value,
        updated_fields: Map<String, Value>,
        removed_fields: Vec<String>,
    },
    Delete {
        namespace: Namespace,
        document_key: Value,
    },
    Create {
        namespace: Namespace,
    },
    ShardCollection {
        namespace: Namespace,
    },
    Drop {
        namespace: Namespace,
    },
    DropDatabase {
        database: String,
    },
    /// Written by the cluster to advance a shard's log without a user-visible change.
    Noop,
}

impl LogOperation {
    /// Database the operation applies to, `None` for [`LogOperation::Noop`].
    pub fn database(&self) -> Option<&str> {
        match self {
            LogOperation::DropDatabase { database } => Some(database),
            LogOperation::Noop => None,
            other => other.namespace().map(|ns| ns.db.as_str()),
        }
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            LogOperation::Insert { namespace, .. }
            | LogOperation::Update { namespace, .. }
            | LogOperation::Delete { namespace, .. }
            | LogOperation::Create { namespace }
            | LogOperation::ShardCollection { namespace }
            | LogOperation::Drop { namespace } => Some(namespace),
            LogOperation::DropDatabase { .. } | LogOperation::Noop => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub position: LogPosition,
    pub operation: LogOperation,
    /// Set on inserts and deletes performed by chunk migrations.
    pub from_migrate: bool,
}

impl LogEntry {
    pub fn cluster_time(&self) -> LogicalTimestamp {
        self.position.cluster_time
    }

    pub fn txn_index(&self) -> u32 {
        self.position.txn_index
    }
}

/// Result of a log read.
///
/// `applied_through` is the cluster time through which the shard has applied every write,
/// so no entry at or before it can appear later in this log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub entries: Vec<LogEntry>,
    pub applied_through: LogicalTimestamp,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    truncated_through: Option<LogPosition>,
}

#[derive(Debug)]
struct ShardLogInner {
    shard_id: ShardId,
    clock: ClusterClock,
    state: Mutex<LogState>,
    available: AtomicBool,
    appended: Notify,
}

/// Append-only write log of one shard, totally ordered by [`LogPosition`].
#[derive(Debug, Clone)]
pub struct ShardLog {
    inner: Arc<ShardLogInner>,
}

impl ShardLog {
    pub fn new(shard_id: ShardId, clock: ClusterClock) -> Self {
        Self {
            inner: Arc::new(ShardLogInner {
                shard_id,
                clock,
                state: Mutex::new(LogState::default()),
                available: AtomicBool::new(true),
                appended: Notify::new(),
            }),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.inner.shard_id
    }

    /// Reads up to `max_entries` entries positioned strictly after `after`.
    pub fn read_after(&self, after: LogPosition, max_entries: usize) -> Result<LogBatch, ClusterError> {
        self.ensure_available()?;

        let state = self.lock_state();
        if let Some(truncated_through) = state.truncated_through
            && after < truncated_through
        {
            return Err(ClusterError::HistoryLost {
                shard: self.inner.shard_id.clone(),
                requested: after,
            });
        }

        let start = state.entries.partition_point(|entry| entry.position <= after);
        let entries = state.entries[start..]
            .iter()
            .take(max_entries)
            .cloned()
            .collect::<Vec<_>>();

        // Read under the log lock: any commit touching this shard holds the same lock while
        // it ticks the clock, so nothing at or before this time can still be appended here.
        let applied_through = self.inner.clock.now();

        Ok(LogBatch {
            entries,
            applied_through,
        })
    }

    /// Waits until an entry positioned after `after` exists or `timeout` elapses.
    ///
    /// Returns `true` if such an entry exists when the wait ends.
    pub async fn wait_for_entries_after(&self, after: LogPosition, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_entries_after(after) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.has_entries_after(after);
            }
        }
    }

    pub fn last_position(&self) -> Option<LogPosition> {
        self.lock_state().entries.last().map(|entry| entry.position)
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        debug!(shard = %self.inner.shard_id, available, "changing shard availability");
        self.inner.available.store(available, Ordering::Release);
        self.inner.appended.notify_waiters();
    }

    /// Discards every entry at or before `through`.
    ///
    /// Reads resuming from a position older than `through` fail with
    /// [`ClusterError::HistoryLost`] afterwards.
    pub fn truncate_through(&self, through: LogPosition) {
        let mut state = self.lock_state();
        state.entries.retain(|entry| entry.position > through);
        state.truncated_through = Some(state.truncated_through.map_or(through, |t| t.max(through)));

        debug!(shard = %self.inner.shard_id, %through, "truncated shard log");
    }

    /// Locks the log for appending.
    ///
    /// Callers committing to several shards lock them in [`ShardId`] order.
    pub(crate) fn writer(&self) -> ShardLogWriter<'_> {
        ShardLogWriter {
            log: self,
            state: self.lock_state(),
            appended: 0,
        }
    }

    fn has_entries_after(&self, after: LogPosition) -> bool {
        self.lock_state()
            .entries
            .last()
            .is_some_and(|entry| entry.position > after)
    }

    fn ensure_available(&self) -> Result<(), ClusterError> {
        if !self.is_available() {
            return Err(ClusterError::ShardUnavailable(self.inner.shard_id.clone()));
        }

        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive append access to a [`ShardLog`].
///
/// Readers waiting on the log are woken once the writer is dropped.
pub(crate) struct ShardLogWriter<'a> {
    log: &'a ShardLog,
    state: MutexGuard<'a, LogState>,
    appended: usize,
}

impl ShardLogWriter<'_> {
    pub(crate) fn append(&mut self, position: LogPosition, operation: LogOperation, from_migrate: bool) {
        debug_assert!(
            self.state
                .entries
                .last()
                .is_none_or(|last| last.position < position),
            "shard log positions must be strictly increasing"
        );

        self.state.entries.push(LogEntry {
            position,
            operation,
            from_migrate,
        });
        self.appended += 1;
    }
}

impl Drop for ShardLogWriter<'_> {
    fn drop(&mut self) {
        if self.appended > 0 {
            self.log.inner.appended.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(id: i64) -> LogOperation {
        LogOperation::Insert {
            namespace: Namespace::new("test", "coll"),
            document: json!({ "_id": id }),
        }
    }

    fn log_with_entries(count: u32) -> (ShardLog, ClusterClock) {
        let clock = ClusterClock::new();
        let log = ShardLog::new(ShardId::new("shard0"), clock.clone());
        for id in 0..count {
            let mut writer = log.writer();
            let ts = clock.tick();
            writer.append(LogPosition::new(ts, 0), insert(id as i64), false);
        }
        (log, clock)
    }

    #[test]
    fn reads_entries_after_position() {
        let (log, clock) = log_with_entries(3);
        let all = log.read_after(LogPosition::default(), 10).unwrap();
        assert_eq!(all.entries.len(), 3);
        assert_eq!(all.applied_through, clock.now());

        let rest = log.read_after(all.entries[0].position, 10).unwrap();
        assert_eq!(rest.entries.len(), 2);
        assert_eq!(rest.entries[0], all.entries[1]);

        let limited = log.read_after(LogPosition::default(), 1).unwrap();
        assert_eq!(limited.entries.len(), 1);
    }

    #[test]
    fn unavailable_log_rejects_reads() {
        let (log, _) = log_with_entries(1);
        log.set_available(false);
        assert_eq!(
            log.read_after(LogPosition::default(), 10),
            Err(ClusterError::ShardUnavailable(ShardId::new("shard0")))
        );

        log.set_available(true);
        assert!(log.read_after(LogPosition::default(), 10).is_ok());
    }

    #[test]
    fn truncated_history_is_reported() {
        let (log, _) = log_with_entries(3);
        let second = log.read_after(LogPosition::default(), 10).unwrap().entries[1].position;
        log.truncate_through(second);

        assert!(matches!(
            log.read_after(LogPosition::default(), 10),
            Err(ClusterError::HistoryLost { .. })
        ));
        assert_eq!(log.read_after(second, 10).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn wait_wakes_on_append() {
        let (log, clock) = log_with_entries(0);
        let waiter = log.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_entries_after(LogPosition::default(), Duration::from_secs(5))
                .await
        });

        tokio::task::yield_now().await;
        {
            let mut writer = log.writer();
            writer.append(LogPosition::new(clock.tick(), 0), insert(1), false);
        }

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_without_entries() {
        let (log, _) = log_with_entries(0);
        let found = log
            .wait_for_entries_after(LogPosition::default(), Duration::from_millis(20))
            .await;
        assert!(!found);
    }
}
