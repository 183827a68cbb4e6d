use std::sync::Arc;
use std::time::Duration;

use cluster::LogicalTimestamp;
use config::shared::ReconnectionConfig;
use metrics::counter;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::adapter::{CursorItem, ShardCursor};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::StreamError;
use crate::metrics::{CHANGESTREAM_PARTICIPANT_RETRIES_TOTAL, SHARD_ID_LABEL};
use crate::reconnect::ReconnectionManager;
use crate::source::ShardSource;
use crate::types::{ChangeEvent, StreamId};

/// Message sent by a participant task to the merger.
#[derive(Debug)]
pub enum ParticipantUpdate {
    Event(Box<ChangeEvent>),
    /// Every entry of the shard at or before this time was reported.
    Heartbeat(LogicalTimestamp),
    /// A read failed and will be retried.
    Unavailable { attempt: u32, error: StreamError },
    /// The participant gave up. Nothing else is sent afterwards.
    Failed(StreamError),
}

/// Task reading one shard for one stream.
///
/// Updates are pushed into a bounded channel, so a participant stops reading while the merger
/// is not consuming. The shared [`Notify`] is signalled after every send to wake up the merger.
pub struct ParticipantTask<S> {
    stream_id: StreamId,
    cursor: ShardCursor<S>,
    tx: mpsc::Sender<ParticipantUpdate>,
    notify: Arc<Notify>,
    shutdown_rx: ShutdownRx,
    reconnection: ReconnectionManager,
    poll_interval: Duration,
}

impl<S> ParticipantTask<S>
where
    S: ShardSource,
{
    pub fn new(
        stream_id: StreamId,
        cursor: ShardCursor<S>,
        tx: mpsc::Sender<ParticipantUpdate>,
        notify: Arc<Notify>,
        shutdown_rx: ShutdownRx,
        reconnection: ReconnectionConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stream_id,
            cursor,
            tx,
            notify,
            shutdown_rx,
            reconnection: ReconnectionManager::new(reconnection),
            poll_interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let participant_span = tracing::info_span!(
            "participant",
            stream_id = %self.stream_id,
            shard_id = %self.cursor.shard_id()
        );

        tokio::spawn(self.run().instrument(participant_span))
    }

    async fn run(mut self) {
        debug!(position = %self.cursor.position(), "participant started");

        loop {
            let result = tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    debug!("participant received shutdown signal");
                    return;
                }
                result = self.cursor.next(self.poll_interval) => result,
            };

            match result {
                Ok(item) => {
                    if self.reconnection.attempt_count() > 0 {
                        info!(
                            attempts = self.reconnection.attempt_count(),
                            retry_duration = ?self.reconnection.total_retry_duration(),
                            "shard reachable again"
                        );
                    }
                    self.reconnection.record_success();

                    let update = match item {
                        CursorItem::Event(event) => ParticipantUpdate::Event(event),
                        CursorItem::Heartbeat(cluster_time) => {
                            ParticipantUpdate::Heartbeat(cluster_time)
                        }
                    };
                    if !self.send(update).await {
                        return;
                    }
                }
                Err(err) => {
                    let err = err.with_shard(self.cursor.shard_id());

                    if !self.reconnection.should_retry(&err) {
                        warn!(error = %err, "participant failed");
                        self.reconnection.mark_failed(err.to_string());
                        self.send(ParticipantUpdate::Failed(err)).await;
                        return;
                    }

                    self.reconnection.record_failure(err.clone());
                    let attempt = self.reconnection.attempt_count();
                    let backoff = self.reconnection.calculate_backoff();

                    warn!(
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "shard read failed, will retry after backoff"
                    );
                    counter!(
                        CHANGESTREAM_PARTICIPANT_RETRIES_TOTAL,
                        SHARD_ID_LABEL => self.cursor.shard_id().to_string()
                    )
                    .increment(1);

                    if !self
                        .send(ParticipantUpdate::Unavailable { attempt, error: err })
                        .await
                    {
                        return;
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_rx.changed() => {
                            debug!("participant shutting down during backoff");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sends `update` to the merger. Returns `false` if the participant has to stop.
    async fn send(&mut self, update: ParticipantUpdate) -> bool {
        let sent = tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => false,
            result = self.tx.send(update) => result.is_ok(),
        };

        if sent {
            self.notify.notify_one();
        }

        sent
    }
}
