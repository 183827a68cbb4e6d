//! Turns one shard's write log into change events for a scope.

use std::collections::VecDeque;
use std::time::Duration;

use cluster::{LogEntry, LogOperation, LogPosition, LogicalTimestamp, ShardId};
use tokio::time::Instant;
use tracing::debug;

use crate::error::StreamResult;
use crate::failpoints::{SHARD_CURSOR__BEFORE_READ, stream_fail_point};
use crate::source::ShardSource;
use crate::token::{ResumeTokenCodec, TokenData, TokenVersion};
use crate::types::{ChangeEvent, EventNamespace, OperationType, UpdateDescription, WatchScope};

/// Decides which log entries of a shard become events, and renders them.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    pub scope: WatchScope,
    pub show_expanded_events: bool,
    pub show_system_events: bool,
    pub token_version: TokenVersion,
}

impl ScopeFilter {
    /// Converts `entry` into an event, or returns `None` if the scope does not observe it.
    ///
    /// Writes performed by chunk migrations are never surfaced: the same documents were
    /// already reported by the shard they came from.
    pub fn to_event(&self, entry: &LogEntry) -> Option<ChangeEvent> {
        if entry.from_migrate {
            return None;
        }

        let operation = &entry.operation;
        let (operation_type, namespace) = match operation {
            LogOperation::Noop => return None,
            LogOperation::DropDatabase { database } => {
                if !self.scope.includes_database(database) {
                    return None;
                }
                (
                    OperationType::DropDatabase,
                    EventNamespace::database(database.clone()),
                )
            }
            LogOperation::Create { namespace } | LogOperation::ShardCollection { namespace }
                if !self.show_expanded_events =>
            {
                debug!(%namespace, "skipping expanded event");
                return None;
            }
            other => {
                let namespace = other.namespace()?;
                if !self
                    .scope
                    .includes_namespace(namespace, self.show_system_events)
                {
                    return None;
                }
                (operation_type_of(other)?, EventNamespace::from(namespace))
            }
        };

        let (document_key, full_document, update_description) = match operation {
            LogOperation::Insert { document, .. } => (
                document.get("_id").map(|id| serde_json::json!({ "_id": id })),
                Some(document.clone()),
                None,
            ),
            LogOperation::Update {
                document_key,
                updated_fields,
                removed_fields,
                ..
            } => (
                Some(document_key.clone()),
                None,
                Some(UpdateDescription {
                    updated_fields: updated_fields.clone(),
                    removed_fields: removed_fields.clone(),
                }),
            ),
            LogOperation::Delete { document_key, .. } => (Some(document_key.clone()), None, None),
            _ => (None, None, None),
        };

        let mut token = TokenData::new(entry.position, self.token_version)
            .with_event_type(operation_type);
        if let Some(document_key) = &document_key {
            token = token.with_document_key(document_key);
        }

        Some(ChangeEvent {
            resume_token: ResumeTokenCodec::encode(&token),
            operation_type,
            namespace: Some(namespace),
            document_key,
            full_document,
            update_description,
            cluster_time: entry.cluster_time(),
            txn_index: entry.txn_index(),
        })
    }
}

fn operation_type_of(operation: &LogOperation) -> Option<OperationType> {
    match operation {
        LogOperation::Insert { .. } => Some(OperationType::Insert),
        LogOperation::Update { .. } => Some(OperationType::Update),
        LogOperation::Delete { .. } => Some(OperationType::Delete),
        LogOperation::Create { .. } => Some(OperationType::Create),
        LogOperation::ShardCollection { .. } => Some(OperationType::ShardCollection),
        LogOperation::Drop { .. } => Some(OperationType::Drop),
        LogOperation::DropDatabase { .. } => Some(OperationType::DropDatabase),
        LogOperation::Noop => None,
    }
}

/// Item produced by [`ShardCursor::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    Event(Box<ChangeEvent>),
    /// Every entry of the shard at or before this time has been read.
    Heartbeat(LogicalTimestamp),
}

/// Pull based cursor over one shard's log, filtered to a scope.
///
/// The cursor remembers the last entry it read, so a failed read can simply be retried with
/// the same cursor.
#[derive(Debug)]
pub struct ShardCursor<S> {
    source: S,
    filter: ScopeFilter,
    position: LogPosition,
    pending: VecDeque<ChangeEvent>,
    read_batch_size: usize,
}

impl<S> ShardCursor<S>
where
    S: ShardSource,
{
    /// Opens a cursor yielding entries strictly after `start`.
    ///
    /// Fails if the shard's log no longer reaches back to `start`.
    pub async fn open(
        source: S,
        filter: ScopeFilter,
        start: LogPosition,
        read_batch_size: usize,
    ) -> StreamResult<Self> {
        source.read(start, 0).await?;

        debug!(shard_id = %source.shard_id(), %start, "opened shard cursor");

        Ok(Self {
            source,
            filter,
            position: start,
            pending: VecDeque::new(),
            read_batch_size,
        })
    }

    pub fn shard_id(&self) -> &ShardId {
        self.source.shard_id()
    }

    /// Position of the last entry read, whether or not it became an event.
    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Returns the next event in scope, or a heartbeat if none arrives within `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> StreamResult<CursorItem> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(CursorItem::Event(Box::new(event)));
        }

        let deadline = Instant::now() + timeout;
        loop {
            stream_fail_point(SHARD_CURSOR__BEFORE_READ)?;

            let batch = self.source.read(self.position, self.read_batch_size).await?;
            if batch.entries.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(CursorItem::Heartbeat(batch.applied_through));
                }

                // Whether or not something arrived, the next read reports a fresher time.
                self.source
                    .wait_for_entries(self.position, deadline - now)
                    .await?;
                continue;
            }

            for entry in &batch.entries {
                self.position = entry.position;
                if let Some(event) = self.filter.to_event(entry) {
                    self.pending.push_back(event);
                }
            }

            if let Some(event) = self.pending.pop_front() {
                return Ok(CursorItem::Event(Box::new(event)));
            }
        }
    }
}
