//! Polling and classification of cluster topology changes.
//!
//! The detector keeps the last topology version a stream has seen and the cluster time its
//! view is complete through. The merger never delivers an event newer than that time, so a
//! topology change is always classified before any event that depends on it.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use cluster::{LogicalTimestamp, Namespace, ShardDelta, ShardId, TopologyChange, TopologyVersion};
use config::shared::TopologyConfig;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StreamResult;
use crate::failpoints::{TOPOLOGY__BEFORE_POLL, stream_fail_point};
use crate::source::ClusterConnector;
use crate::types::WatchScope;

/// Effect of a topology change on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The change does not touch data the stream observes.
    NoAction,
    /// Data moved between shards that are both read by the stream.
    Safe,
    /// A participating shard was removed and the stream tolerates removals. The participant
    /// keeps draining until it has reported everything up to `at`.
    DrainRemoved { shard: ShardId, at: LogicalTimestamp },
    /// A participating shard was removed and the stream does not tolerate removals.
    ShardRemoved { shard: ShardId, at: LogicalTimestamp },
    /// Data in scope moved to a shard the stream does not read.
    Terminal {
        namespace: Namespace,
        shard: ShardId,
        at: LogicalTimestamp,
    },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::NoAction => "no_action",
            Transition::Safe => "safe",
            Transition::DrainRemoved { .. } => "drain_removed",
            Transition::ShardRemoved { .. } => "shard_removed",
            Transition::Terminal { .. } => "terminal",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Tracks the topology a stream was opened against.
#[derive(Debug)]
pub struct TopologyChangeDetector<C> {
    connector: C,
    scope: WatchScope,
    show_system_events: bool,
    ignore_removed_shards: bool,
    version: TopologyVersion,
    as_of: LogicalTimestamp,
    poll_interval: Duration,
    next_poll: Instant,
}

impl<C> TopologyChangeDetector<C>
where
    C: ClusterConnector,
{
    /// Creates a detector that already knows every change up to `version`, complete through
    /// cluster time `as_of`.
    pub fn new(
        connector: C,
        scope: WatchScope,
        show_system_events: bool,
        ignore_removed_shards: bool,
        version: TopologyVersion,
        as_of: LogicalTimestamp,
        config: &TopologyConfig,
    ) -> Self {
        let poll_interval = config.poll_interval();

        Self {
            connector,
            scope,
            show_system_events,
            ignore_removed_shards,
            version,
            as_of,
            poll_interval,
            next_poll: Instant::now() + poll_interval,
        }
    }

    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// Cluster time through which every topology change has been observed.
    pub fn as_of(&self) -> LogicalTimestamp {
        self.as_of
    }

    pub fn next_poll(&self) -> Instant {
        self.next_poll
    }

    pub fn is_poll_due(&self, now: Instant) -> bool {
        now >= self.next_poll
    }

    /// Fetches the changes made since the last successful poll.
    ///
    /// The next poll is scheduled whether or not this one succeeds.
    pub async fn poll(&mut self) -> StreamResult<(TopologyVersion, Vec<TopologyChange>)> {
        self.next_poll = Instant::now() + self.poll_interval;

        stream_fail_point(TOPOLOGY__BEFORE_POLL)?;
        let update = self.connector.topology_since(self.version).await?;

        if update.version > self.version {
            debug!(
                from = %self.version,
                to = %update.version,
                changes = update.changes.len(),
                "observed new topology version"
            );
        }
        self.version = self.version.max(update.version);
        self.as_of = self.as_of.max(update.as_of);

        Ok((self.version, update.changes))
    }

    /// Classifies `change` for a stream currently reading from `participants`.
    pub fn classify(&self, change: &TopologyChange, participants: &BTreeSet<ShardId>) -> Transition {
        match &change.delta {
            ShardDelta::Added { .. } => Transition::NoAction,
            ShardDelta::Removed { shard } => {
                if !participants.contains(shard) {
                    Transition::NoAction
                } else if self.ignore_removed_shards {
                    Transition::DrainRemoved {
                        shard: shard.clone(),
                        at: change.cluster_time,
                    }
                } else {
                    Transition::ShardRemoved {
                        shard: shard.clone(),
                        at: change.cluster_time,
                    }
                }
            }
            ShardDelta::Migrated { namespace, to, .. }
            | ShardDelta::Placed {
                namespace,
                shard: to,
            } => {
                if !self
                    .scope
                    .includes_namespace(namespace, self.show_system_events)
                {
                    Transition::NoAction
                } else if participants.contains(to) {
                    Transition::Safe
                } else {
                    Transition::Terminal {
                        namespace: namespace.clone(),
                        shard: to.clone(),
                        at: change.cluster_time,
                    }
                }
            }
        }
    }
}
