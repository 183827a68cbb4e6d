//! Opening change streams and consuming them.
//!
//! [`ChangeStreamService::open`] validates a request, resolves where the stream starts, picks
//! the shards that hold data in scope and starts a [`Merger`] over them. The returned
//! [`ChangeStream`] is the consumer facing cursor.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use cluster::{LogPosition, PlacementSnapshot, ShardId, TopologyVersion};
use config::shared::StreamServiceConfig;
use futures::Stream;
use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{ScopeFilter, ShardCursor};
use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, StreamResult};
use crate::merger::{MergeSettings, Merger, MergerState, ParticipantState};
use crate::metrics::{
    CHANGESTREAM_EVENTS_DELIVERED_TOTAL, CHANGESTREAM_OPEN_STREAMS,
    CHANGESTREAM_STREAM_FAILURES_TOTAL, ERROR_KIND_LABEL, OPERATION_TYPE_LABEL,
};
use crate::options::{ChangeStreamOptions, OpenRequest};
use crate::source::ClusterConnector;
use crate::stream_error;
use crate::token::ResumeToken;
use crate::topology::TopologyChangeDetector;
use crate::types::{ChangeEvent, StreamId, WatchScope};

/// Where a stream starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// After everything committed when the stream is opened.
    Now,
    /// Strictly after the given position.
    After(LogPosition),
}

/// Resolves the start specifiers of `options`.
///
/// At most one of `resumeAfter`, `startAfter` and `startAtTime` may be set. A token of a
/// terminal event is only accepted by `startAfter`.
pub fn resolve_start(options: &ChangeStreamOptions) -> StreamResult<StartPosition> {
    let specified = [
        options.resume_after.is_some(),
        options.start_after.is_some(),
        options.start_at_time.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if specified > 1 {
        bail!(
            ErrorKind::InvalidOptions,
            "Only one of resumeAfter, startAfter and startAtTime may be specified"
        );
    }

    if let Some(token) = &options.resume_after {
        if token.is_from_invalidate() {
            bail!(
                ErrorKind::InvalidResumeToken,
                "A token of an invalidate event cannot be used with resumeAfter, use startAfter",
                format!("token {token}")
            );
        }
        return Ok(StartPosition::After(token.position()));
    }

    if let Some(token) = &options.start_after {
        // A terminal event has no log entry of its own: the new stream starts right before it.
        if token.is_from_invalidate() {
            return Ok(StartPosition::After(token.position().predecessor()));
        }
        return Ok(StartPosition::After(token.position()));
    }

    if let Some(cluster_time) = options.start_at_time {
        return Ok(StartPosition::After(LogPosition::just_before(cluster_time)));
    }

    Ok(StartPosition::Now)
}

/// Opens change streams against a cluster.
#[derive(Debug, Clone)]
pub struct ChangeStreamService<C> {
    connector: C,
    config: StreamServiceConfig,
}

impl<C> ChangeStreamService<C>
where
    C: ClusterConnector,
{
    pub fn new(connector: C, config: StreamServiceConfig) -> StreamResult<Self> {
        config.validate()?;

        Ok(Self { connector, config })
    }

    pub fn config(&self) -> &StreamServiceConfig {
        &self.config
    }

    /// Opens a stream. Caller errors, removed shards and lost history are reported here,
    /// before any event is produced.
    pub async fn open(&self, request: OpenRequest) -> StreamResult<ChangeStream<C>> {
        let OpenRequest { scope, options } = request;

        scope.validate()?;
        let feature_level = self.connector.feature_level().await?;
        options.validate(feature_level)?;
        let start = resolve_start(&options)?;

        // We read placement once, so that participants and the initial topology version come
        // from the same catalog state.
        let snapshot = self.connector.placement().await?;
        let start_position = match start {
            StartPosition::Now => LogPosition::end_of(snapshot.cluster_time),
            StartPosition::After(position) => position,
        };

        let shards = select_participants(
            &scope,
            options.system_events(),
            options.ignores_removed_shards(),
            &snapshot,
            start_position,
        )?;

        let filter = ScopeFilter {
            scope: scope.clone(),
            show_expanded_events: options.expanded_events(),
            show_system_events: options.system_events(),
            token_version: options.effective_token_version(),
        };
        let mut cursors = Vec::with_capacity(shards.len());
        for shard in &shards {
            let source = self.connector.connect(shard).await?;
            let cursor = ShardCursor::open(
                source,
                filter.clone(),
                start_position,
                self.config.merger.read_batch_size,
            )
            .await?;
            cursors.push(cursor);
        }

        let id = Uuid::new_v4();
        let detector = TopologyChangeDetector::new(
            self.connector.clone(),
            scope.clone(),
            options.system_events(),
            options.ignores_removed_shards(),
            snapshot.topology_version,
            snapshot.cluster_time,
            &self.config.topology,
        );
        let settings = MergeSettings {
            scope: scope.clone(),
            token_version: options.effective_token_version(),
            retry_needed: options.wants_retry_needed(),
        };
        let mut merger =
            Merger::start(id, detector, cursors, start_position, settings, &self.config);
        if let Some(token) = &options.resume_after
            && let Some(operation_type) = token.data().event_type
            && scope.is_invalidated_by_operation(operation_type)
        {
            merger.invalidate_after(token.data().cluster_time);
        }

        gauge!(CHANGESTREAM_OPEN_STREAMS).increment(1.0);
        info!(
            stream_id = %id,
            %scope,
            start = %start_position,
            participants = ?shards,
            topology_version = %snapshot.topology_version,
            "opened change stream"
        );

        let shape_id = options.shape_id(&scope);
        let (canceller, cancel_rx) = create_shutdown_channel();
        Ok(ChangeStream {
            id,
            merger,
            state: CursorState {
                scope,
                topology_version: snapshot.topology_version,
                last_token: None,
                closed: false,
                requires_start_after: false,
            },
            shape_id,
            canceller,
            cancel_rx,
        })
    }
}

/// Returns the shards a stream starting at `start` has to read.
fn select_participants(
    scope: &WatchScope,
    show_system_events: bool,
    ignore_removed_shards: bool,
    snapshot: &PlacementSnapshot,
    start: LogPosition,
) -> StreamResult<Vec<ShardId>> {
    let mut candidates = snapshot
        .placement
        .iter()
        .filter(|entry| scope.includes_namespace(&entry.namespace, show_system_events))
        .map(|entry| entry.shard.clone())
        .collect::<BTreeSet<_>>();

    // Database level records are written by the primary, which may hold no collection data.
    match scope.database_name() {
        Some(database) => {
            if let Some(primary) = snapshot.primaries.get(database) {
                candidates.insert(primary.clone());
            }
        }
        None => candidates.extend(snapshot.shards.iter().cloned()),
    }

    let mut participants = Vec::with_capacity(candidates.len());
    for shard in candidates {
        if snapshot.contains_shard(&shard) {
            participants.push(shard);
            continue;
        }

        let Some(removal) = snapshot.removal_of(&shard) else {
            continue;
        };
        if start >= LogPosition::just_before(removal.removed_at) {
            debug!(shard_id = %shard, "skipping shard removed before the start position");
            continue;
        }
        if ignore_removed_shards {
            warn!(
                shard_id = %shard,
                removed_at = %removal.removed_at,
                "skipping removed shard that held data after the start position"
            );
            continue;
        }

        return Err(stream_error!(
            ErrorKind::ShardRemoved,
            "The resume point references a shard that was removed from the cluster",
            format!("shard removed at {}, stream starts after {start}", removal.removed_at)
        )
        .with_shard(&shard));
    }

    if participants.is_empty() {
        let fallback = scope
            .database_name()
            .and_then(|database| snapshot.primaries.get(database))
            .or(snapshot.default_primary.as_ref())
            .filter(|shard| snapshot.contains_shard(shard));
        match fallback {
            Some(shard) => participants.push(shard.clone()),
            None => bail!(ErrorKind::InvalidState, "The cluster has no shard to read from"),
        }
    }

    Ok(participants)
}

/// Consumer visible state of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub scope: WatchScope,
    pub topology_version: TopologyVersion,
    /// Token of the last delivered event.
    pub last_token: Option<ResumeToken>,
    pub closed: bool,
    /// Set after a terminal event: the stream can only be continued with `startAfter`.
    pub requires_start_after: bool,
}

/// Cancels a [`ChangeStream`] from another task.
#[derive(Debug, Clone)]
pub struct StreamCanceller(ShutdownTx);

impl StreamCanceller {
    /// Makes an in-flight and every later `next()` fail with [`ErrorKind::Cancelled`].
    pub fn cancel(&self) {
        self.0.shutdown();
    }
}

/// An open change stream.
pub struct ChangeStream<C> {
    id: StreamId,
    merger: Merger<C>,
    state: CursorState,
    shape_id: u64,
    canceller: ShutdownTx,
    cancel_rx: ShutdownRx,
}

impl<C> fmt::Debug for ChangeStream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("shape_id", &self.shape_id)
            .field("merger", &self.merger)
            .finish()
    }
}

impl<C> ChangeStream<C>
where
    C: ClusterConnector,
{
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    /// Identity of the stream's scope and explicitly set options.
    pub fn shape_id(&self) -> u64 {
        self.shape_id
    }

    pub fn merger_state(&self) -> MergerState {
        self.merger.state()
    }

    pub fn participant_states(&self) -> Vec<(ShardId, ParticipantState)> {
        self.merger.participant_states()
    }

    /// Token to continue from, see [`Merger::resume_token`].
    pub fn resume_token(&self) -> ResumeToken {
        self.merger.resume_token()
    }

    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller(self.canceller.clone())
    }

    /// Returns the next event, or `None` if none is available within `timeout`.
    ///
    /// A timeout leaves the stream untouched, so the call can simply be repeated. Errors and
    /// terminal events close the stream.
    pub async fn next(&mut self, timeout: Duration) -> StreamResult<Option<ChangeEvent>> {
        if self.cancel_rx.is_shutdown() {
            self.close();
            bail!(ErrorKind::Cancelled, "The change stream was cancelled");
        }
        if self.state.closed {
            bail!(
                ErrorKind::CursorAlreadyClosed,
                "The change stream is closed",
                detail = if self.state.requires_start_after {
                    "reopen the stream with startAfter"
                } else {
                    "open a new stream"
                }
            );
        }

        let deadline = Instant::now() + timeout;
        let result = tokio::select! {
            biased;

            _ = self.cancel_rx.changed() => {
                self.close();
                bail!(ErrorKind::Cancelled, "The change stream was cancelled");
            }
            result = self.merger.next(deadline) => result,
        };

        match result {
            Ok(Some(event)) => {
                self.state.last_token = Some(event.resume_token.clone());
                self.state.topology_version = self.merger.topology_version();
                counter!(
                    CHANGESTREAM_EVENTS_DELIVERED_TOTAL,
                    OPERATION_TYPE_LABEL => event.operation_type.as_str()
                )
                .increment(1);

                if event.is_terminal() {
                    self.state.closed = true;
                    self.state.requires_start_after = true;
                    self.merger.shutdown();
                }

                Ok(Some(event))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                let err = err.with_last_token(self.state.last_token.as_ref());
                error!(stream_id = %self.id, error = %err, "change stream failed");
                counter!(
                    CHANGESTREAM_STREAM_FAILURES_TOTAL,
                    ERROR_KIND_LABEL => format!("{:?}", err.kind())
                )
                .increment(1);
                self.close();

                Err(err)
            }
        }
    }

    /// Closes the stream and stops its participants. Idempotent.
    pub fn close(&mut self) {
        if !self.state.closed {
            debug!(stream_id = %self.id, "closing change stream");
        }
        self.state.closed = true;
        self.merger.shutdown();
    }

    /// Adapts the stream to a [`Stream`] of events.
    ///
    /// The stream ends after a terminal event or the first error, which is yielded.
    pub fn into_stream(self, poll_timeout: Duration) -> impl Stream<Item = StreamResult<ChangeEvent>> {
        futures::stream::unfold(Some(self), move |stream| async move {
            let mut stream = stream?;
            loop {
                match stream.next(poll_timeout).await {
                    Ok(Some(event)) => {
                        let next = (!event.is_terminal()).then_some(stream);
                        return Some((Ok(event), next));
                    }
                    Ok(None) => continue,
                    Err(err) => return Some((Err(err), None)),
                }
            }
        })
    }
}

impl<C> Drop for ChangeStream<C> {
    fn drop(&mut self) {
        gauge!(CHANGESTREAM_OPEN_STREAMS).decrement(1.0);
    }
}
