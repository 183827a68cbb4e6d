//! Merges the events of every participating shard into one stream ordered by cluster time.
//!
//! Each participant task reads one shard and sends events and heartbeats over its own channel.
//! The merger holds at most one undelivered event (the head) per participant and delivers the
//! smallest head once no other participant can still produce something ordered before it:
//! either that participant holds a larger head, or its low-water mark, the position through
//! which it has reported everything, has passed the head.
//!
//! Topology changes are polled by the same loop. An event is only delivered once the topology
//! is known through its cluster time. Changes that end the stream schedule a stop at their
//! cluster time; events at or after the stop are discarded and the terminal event (or error) is
//! produced as soon as every participant has reported everything before it.

mod participant;

pub use participant::{ParticipantTask, ParticipantUpdate};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cluster::{LogPosition, LogicalTimestamp, ShardId, TopologyVersion};
use config::shared::StreamServiceConfig;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::ShardCursor;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, StreamError, StreamResult};
use crate::metrics::{
    CHANGESTREAM_LAGGING_PARTICIPANTS, CHANGESTREAM_MERGE_WAIT_SECONDS,
    CHANGESTREAM_TOPOLOGY_CHANGES_TOTAL, SHARD_ID_LABEL, TRANSITION_LABEL,
};
use crate::source::ClusterConnector;
use crate::token::{ResumeToken, ResumeTokenCodec, TokenData, TokenVersion};
use crate::topology::{TopologyChangeDetector, Transition};
use crate::types::{ChangeEvent, EventNamespace, OperationType, StreamId, WatchScope};

/// Lifecycle of a merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerState {
    /// No participant has reported yet.
    Initializing,
    Merging,
    /// Delivery is blocked on at least one lagging participant.
    AwaitingLowWaterMark,
    /// A terminal condition is known and the remaining events before it are being drained.
    Invalidated,
    Closed,
}

impl fmt::Display for MergerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MergerState::Initializing => "initializing",
            MergerState::Merging => "merging",
            MergerState::AwaitingLowWaterMark => "awaiting_low_water_mark",
            MergerState::Invalidated => "invalidated",
            MergerState::Closed => "closed",
        };
        f.write_str(state)
    }
}

/// Condition of a single participant as seen by the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Active,
    /// No event or heartbeat within the lag threshold.
    Lagging,
    /// The shard left the cluster and the participant drains what it wrote before.
    Removed,
}

/// Settings of a single stream the merger needs besides the service configuration.
#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub scope: WatchScope,
    pub token_version: TokenVersion,
    /// Report terminal topology changes as `retryNeeded` instead of `invalidate`.
    pub retry_needed: bool,
}

#[derive(Debug)]
struct Head {
    event: Box<ChangeEvent>,
    received_at: Instant,
}

impl Head {
    fn position(&self) -> LogPosition {
        event_position(&self.event)
    }
}

#[derive(Debug, Clone, Copy)]
struct Removal {
    at: LogicalTimestamp,
    deadline: Instant,
}

#[derive(Debug)]
struct Participant {
    rx: mpsc::Receiver<ParticipantUpdate>,
    handle: JoinHandle<()>,
    head: Option<Head>,
    low_water_mark: LogPosition,
    state: ParticipantState,
    last_progress: Instant,
    removal: Option<Removal>,
}

impl Participant {
    /// Greatest position through which nothing undelivered can come from this participant.
    fn delivered_through(&self) -> LogPosition {
        match &self.head {
            Some(head) => head.position().predecessor(),
            None => self.low_water_mark,
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
enum StopReason {
    Invalidate,
    Fatal(StreamError),
}

#[derive(Debug)]
struct PendingStop {
    at: LogicalTimestamp,
    reason: StopReason,
}

/// Merges the participants of one stream.
pub struct Merger<C> {
    stream_id: StreamId,
    participants: BTreeMap<ShardId, Participant>,
    detector: TopologyChangeDetector<C>,
    notify: Arc<Notify>,
    shutdown_tx: ShutdownTx,
    state: MergerState,
    pending_stop: Option<PendingStop>,
    queued_terminal: Option<ChangeEvent>,
    high_water_mark: LogPosition,
    terminal_token: Option<ResumeToken>,
    awaiting_since: Option<Instant>,
    settings: MergeSettings,
    config: StreamServiceConfig,
}

impl<C> Merger<C>
where
    C: ClusterConnector,
{
    /// Spawns one participant task per cursor and returns the merger reading from them.
    ///
    /// Every cursor must be positioned at `start`.
    pub fn start(
        stream_id: StreamId,
        detector: TopologyChangeDetector<C>,
        cursors: Vec<ShardCursor<C::Source>>,
        start: LogPosition,
        settings: MergeSettings,
        config: &StreamServiceConfig,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let (shutdown_tx, _) = create_shutdown_channel();
        let now = Instant::now();

        let participants = cursors
            .into_iter()
            .map(|cursor| {
                let shard = cursor.shard_id().clone();
                let (tx, rx) = mpsc::channel(config.merger.participant_buffer_size);
                let handle = ParticipantTask::new(
                    stream_id,
                    cursor,
                    tx,
                    notify.clone(),
                    shutdown_tx.subscribe(),
                    config.reconnection.clone(),
                    config.merger.poll_interval(),
                )
                .spawn();

                let participant = Participant {
                    rx,
                    handle,
                    head: None,
                    low_water_mark: start,
                    state: ParticipantState::Active,
                    last_progress: now,
                    removal: None,
                };
                (shard, participant)
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            %stream_id,
            participants = participants.len(),
            %start,
            topology_version = %detector.version(),
            "started merger"
        );

        Self {
            stream_id,
            participants,
            detector,
            notify,
            shutdown_tx,
            state: MergerState::Initializing,
            pending_stop: None,
            queued_terminal: None,
            high_water_mark: start,
            terminal_token: None,
            awaiting_since: None,
            settings,
            config: config.clone(),
        }
    }

    pub fn state(&self) -> MergerState {
        self.state
    }

    /// Makes the next call return an invalidate right after `cluster_time`.
    ///
    /// Used when the stream resumes after the event that invalidated its scope, which was
    /// already delivered by the stream that is being continued.
    pub fn invalidate_after(&mut self, cluster_time: LogicalTimestamp) {
        let position = LogPosition::end_of(cluster_time);
        info!(stream_id = %self.stream_id, %position, "stream resumes after its invalidation");
        self.queued_terminal = Some(self.terminal_event(OperationType::Invalidate, position));
        self.state = MergerState::Invalidated;
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.detector.version()
    }

    pub fn participant_states(&self) -> Vec<(ShardId, ParticipantState)> {
        self.participants
            .iter()
            .map(|(shard, participant)| (shard.clone(), participant.state))
            .collect()
    }

    /// Token from which a new stream continues exactly where this one is.
    ///
    /// After a terminal event this is the terminal event's token. Otherwise it is the high-water
    /// mark, which may be ahead of the last delivered event when participants have reported
    /// progress without events.
    pub fn resume_token(&self) -> ResumeToken {
        match &self.terminal_token {
            Some(token) => token.clone(),
            None => ResumeTokenCodec::encode(&TokenData::new(
                self.high_water_mark,
                self.settings.token_version,
            )),
        }
    }

    /// Stops every participant task. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state != MergerState::Closed {
            debug!(stream_id = %self.stream_id, "shutting down merger");
        }
        self.shutdown_tx.shutdown();
        self.participants.clear();
        self.state = MergerState::Closed;
        self.update_lagging_gauge();
    }

    /// Returns the next event, or `None` if none can be delivered before `deadline`.
    ///
    /// Returning `None` has no effect on the stream: a later call continues where this one
    /// stopped. Errors close the merger.
    pub async fn next(&mut self, deadline: Instant) -> StreamResult<Option<ChangeEvent>> {
        let result = self.next_inner(deadline).await;
        if result.is_err() {
            self.shutdown();
        }

        result
    }

    async fn next_inner(&mut self, deadline: Instant) -> StreamResult<Option<ChangeEvent>> {
        loop {
            if let Some(event) = self.queued_terminal.take() {
                return Ok(Some(self.finish(event)));
            }
            if self.state == MergerState::Closed {
                return Ok(None);
            }

            self.drain_updates()?;

            let now = Instant::now();
            if self.detector.is_poll_due(now) {
                self.poll_topology().await?;
            }
            self.drop_drained_participants(now);

            if let Some(event) = self.try_deliver().await? {
                return Ok(Some(event));
            }
            if let Some(event) = self.try_fire_stop()? {
                return Ok(Some(self.finish(event)));
            }

            self.check_lagging(now)?;
            self.advance_high_water_mark();

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = deadline
                .min(self.detector.next_poll())
                .min(now + self.config.merger.poll_interval());
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Moves updates from the participant channels into heads and low-water marks.
    fn drain_updates(&mut self) -> StreamResult<()> {
        let stop = self.pending_stop.as_ref().map(|stop| stop.at);
        let mut received = false;

        for (shard, participant) in self.participants.iter_mut() {
            while participant.head.is_none() {
                let update = match participant.rx.try_recv() {
                    Ok(update) => update,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(stream_error!(
                            ErrorKind::ParticipantPanic,
                            "Participant task ended unexpectedly"
                        )
                        .with_shard(shard));
                    }
                };
                received = true;

                let now = Instant::now();
                match update {
                    ParticipantUpdate::Event(event) => {
                        let position = event_position(&event);
                        if stop.is_some_and(|at| event.cluster_time >= at) {
                            participant.low_water_mark = participant.low_water_mark.max(position);
                        } else {
                            participant.head = Some(Head {
                                event,
                                received_at: now,
                            });
                        }
                    }
                    ParticipantUpdate::Heartbeat(cluster_time) => {
                        participant.low_water_mark = participant
                            .low_water_mark
                            .max(LogPosition::end_of(cluster_time));
                    }
                    ParticipantUpdate::Unavailable { attempt, error } => {
                        debug!(shard_id = %shard, attempt, error = %error, "participant retrying");
                        continue;
                    }
                    ParticipantUpdate::Failed(error) => return Err(error.with_shard(shard)),
                }

                participant.last_progress = now;
                if participant.state == ParticipantState::Lagging {
                    info!(shard_id = %shard, "participant caught up");
                    participant.state = ParticipantState::Active;
                }
            }
        }

        if received && self.state == MergerState::Initializing {
            self.state = MergerState::Merging;
        }

        Ok(())
    }

    /// Polls the topology and applies every change since the last poll.
    ///
    /// Transient failures are logged and retried at the next poll.
    async fn poll_topology(&mut self) -> StreamResult<()> {
        let changes = match self.detector.poll().await {
            Ok((_, changes)) => changes,
            Err(err) if err.kind().is_transient() => {
                warn!(stream_id = %self.stream_id, error = %err, "topology poll failed");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let now = Instant::now();
        let participants = self.participants.keys().cloned().collect::<BTreeSet<_>>();
        for change in changes {
            let transition = self.detector.classify(&change, &participants);
            counter!(
                CHANGESTREAM_TOPOLOGY_CHANGES_TOTAL,
                TRANSITION_LABEL => transition.label()
            )
            .increment(1);
            debug!(
                stream_id = %self.stream_id,
                version = %change.version,
                change = %change.delta,
                %transition,
                "classified topology change"
            );

            match transition {
                Transition::NoAction | Transition::Safe => {}
                Transition::DrainRemoved { shard, at } => {
                    if let Some(participant) = self.participants.get_mut(&shard) {
                        info!(shard_id = %shard, removed_at = %at, "draining removed shard");
                        participant.state = ParticipantState::Removed;
                        participant.removal = Some(Removal {
                            at,
                            deadline: now + self.config.merger.removed_shard_grace(),
                        });
                    }
                }
                Transition::ShardRemoved { shard, at } => {
                    let error = stream_error!(
                        ErrorKind::ShardRemoved,
                        "A shard read by the stream was removed from the cluster",
                        format!("shard removed at {at}")
                    )
                    .with_shard(&shard);
                    self.schedule_stop(at, StopReason::Fatal(error));
                }
                Transition::Terminal { namespace, shard, at } => {
                    info!(
                        stream_id = %self.stream_id,
                        %namespace,
                        shard_id = %shard,
                        at = %at,
                        "data moved to a shard outside the stream"
                    );
                    self.schedule_stop(at, StopReason::Invalidate);
                }
            }
        }

        Ok(())
    }

    /// Keeps the earliest stop and discards heads at or after it.
    fn schedule_stop(&mut self, at: LogicalTimestamp, reason: StopReason) {
        if self.pending_stop.as_ref().is_some_and(|stop| stop.at <= at) {
            return;
        }

        for participant in self.participants.values_mut() {
            if participant
                .head
                .as_ref()
                .is_some_and(|head| head.event.cluster_time >= at)
                && let Some(head) = participant.head.take()
            {
                participant.low_water_mark = participant.low_water_mark.max(head.position());
            }
        }

        self.pending_stop = Some(PendingStop { at, reason });
        self.state = MergerState::Invalidated;
    }

    fn drop_drained_participants(&mut self, now: Instant) {
        self.participants.retain(|shard, participant| {
            let Some(removal) = participant.removal else {
                return true;
            };
            if participant.head.is_some() {
                return true;
            }

            let drained = participant.low_water_mark >= LogPosition::end_of(removal.at);
            if drained || now >= removal.deadline {
                info!(shard_id = %shard, drained, "dropping removed shard from stream");
                return false;
            }

            true
        });
    }

    /// Delivers the smallest head if nothing can still be ordered before it.
    async fn try_deliver(&mut self) -> StreamResult<Option<ChangeEvent>> {
        let mut polled = false;

        loop {
            let Some((shard, position)) = self
                .participants
                .iter()
                .filter_map(|(shard, participant)| {
                    participant.head.as_ref().map(|head| (head.position(), shard))
                })
                .min()
                .map(|(position, shard)| (shard.clone(), position))
            else {
                return Ok(None);
            };

            let blocked = self.participants.iter().any(|(other, participant)| {
                other != &shard && participant.head.is_none() && participant.low_water_mark < position
            });
            if blocked {
                return Ok(None);
            }

            if position.cluster_time > self.detector.as_of() {
                // The topology may have changed before this event.
                if polled {
                    return Ok(None);
                }
                polled = true;
                self.poll_topology().await?;
                continue;
            }

            let Some(participant) = self.participants.get_mut(&shard) else {
                return Ok(None);
            };
            let Some(head) = participant.head.take() else {
                return Ok(None);
            };
            participant.low_water_mark = participant.low_water_mark.max(position);
            self.high_water_mark = self.high_water_mark.max(position);

            histogram!(
                CHANGESTREAM_MERGE_WAIT_SECONDS,
                SHARD_ID_LABEL => shard.to_string()
            )
            .record(head.received_at.elapsed().as_secs_f64());

            let event = *head.event;
            if self.settings.scope.is_invalidated_by(&event) {
                let position = LogPosition::end_of(event.cluster_time);
                self.queued_terminal = Some(self.terminal_event(OperationType::Invalidate, position));
                self.state = MergerState::Invalidated;
            } else if self.state == MergerState::Initializing {
                self.state = MergerState::Merging;
            }

            return Ok(Some(event));
        }
    }

    /// Produces the terminal event or error once everything before the pending stop was
    /// delivered.
    fn try_fire_stop(&mut self) -> StreamResult<Option<ChangeEvent>> {
        let Some(stop) = &self.pending_stop else {
            return Ok(None);
        };

        let boundary = LogPosition::just_before(stop.at);
        let drained = self.participants.values().all(|participant| {
            participant.head.is_none() && participant.low_water_mark >= boundary
        });
        if !drained {
            return Ok(None);
        }

        let Some(stop) = self.pending_stop.take() else {
            return Ok(None);
        };
        match stop.reason {
            StopReason::Invalidate => {
                let operation_type = if self.settings.retry_needed {
                    OperationType::RetryNeeded
                } else {
                    OperationType::Invalidate
                };
                let position = LogPosition::new(stop.at, 0);
                Ok(Some(self.terminal_event(operation_type, position)))
            }
            StopReason::Fatal(error) => {
                self.high_water_mark = self.high_water_mark.max(boundary);
                Err(error)
            }
        }
    }

    fn terminal_event(&self, operation_type: OperationType, position: LogPosition) -> ChangeEvent {
        let token = TokenData::new(position, self.settings.token_version)
            .with_event_type(operation_type)
            .invalidating();

        let namespace = match &self.settings.scope {
            WatchScope::Collection { namespace } => Some(EventNamespace::from(namespace)),
            WatchScope::Database { db } => Some(EventNamespace::database(db.clone())),
            WatchScope::Cluster => None,
        };

        ChangeEvent {
            resume_token: ResumeTokenCodec::encode(&token),
            operation_type,
            namespace,
            document_key: None,
            full_document: None,
            update_description: None,
            cluster_time: position.cluster_time,
            txn_index: position.txn_index,
        }
    }

    /// Closes the merger after its terminal event.
    fn finish(&mut self, event: ChangeEvent) -> ChangeEvent {
        info!(
            stream_id = %self.stream_id,
            operation_type = %event.operation_type,
            cluster_time = %event.cluster_time,
            "stream reached terminal event"
        );
        self.terminal_token = Some(event.resume_token.clone());
        self.shutdown();

        event
    }

    fn check_lagging(&mut self, now: Instant) -> StreamResult<()> {
        let lag_threshold = self.config.merger.lag_threshold();
        let mut lagging_shard = None;

        for (shard, participant) in self.participants.iter_mut() {
            if participant.head.is_some() || participant.state == ParticipantState::Removed {
                continue;
            }

            let idle_for = now.saturating_duration_since(participant.last_progress);
            if idle_for < lag_threshold {
                continue;
            }

            if participant.state == ParticipantState::Active {
                warn!(
                    stream_id = %self.stream_id,
                    shard_id = %shard,
                    idle_ms = idle_for.as_millis() as u64,
                    low_water_mark = %participant.low_water_mark,
                    "participant is lagging"
                );
                participant.state = ParticipantState::Lagging;
            }
            lagging_shard.get_or_insert_with(|| shard.clone());
        }
        self.update_lagging_gauge();

        let Some(shard) = lagging_shard else {
            self.awaiting_since = None;
            if self.state == MergerState::AwaitingLowWaterMark {
                self.state = MergerState::Merging;
            }
            return Ok(());
        };

        if self.state != MergerState::Invalidated {
            self.state = MergerState::AwaitingLowWaterMark;
        }
        let awaiting_since = *self.awaiting_since.get_or_insert(now);

        if let Some(max_stall) = self.config.merger.max_stall()
            && now.saturating_duration_since(awaiting_since) >= max_stall
        {
            return Err(stream_error!(
                ErrorKind::StreamStalled,
                "A participating shard made no progress within the stall limit",
                format!("stalled for {}", format_duration(max_stall))
            )
            .with_shard(&shard));
        }

        Ok(())
    }

    fn advance_high_water_mark(&mut self) {
        let Some(mut candidate) = self
            .participants
            .values()
            .map(Participant::delivered_through)
            .min()
        else {
            return;
        };

        candidate = candidate.min(LogPosition::end_of(self.detector.as_of()));
        if let Some(stop) = &self.pending_stop {
            candidate = candidate.min(LogPosition::just_before(stop.at));
        }

        self.high_water_mark = self.high_water_mark.max(candidate);
    }

    fn update_lagging_gauge(&self) {
        let lagging = self
            .participants
            .values()
            .filter(|participant| participant.state == ParticipantState::Lagging)
            .count();
        gauge!(CHANGESTREAM_LAGGING_PARTICIPANTS).set(lagging as f64);
    }
}

impl<C> Drop for Merger<C> {
    fn drop(&mut self) {
        self.shutdown_tx.shutdown();
    }
}

impl<C> fmt::Debug for Merger<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("participants", &self.participants.len())
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}

fn event_position(event: &ChangeEvent) -> LogPosition {
    LogPosition::new(event.cluster_time, event.txn_index)
}

fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}
