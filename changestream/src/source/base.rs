use std::future::Future;
use std::time::Duration;

use cluster::{
    FeatureLevel, LogBatch, LogPosition, PlacementSnapshot, ShardId, TopologyUpdate,
    TopologyVersion,
};

use crate::error::StreamResult;

/// Read access to one shard's write log.
///
/// Entries are returned in log order. A read never blocks: waiting for new entries is a
/// separate call so that callers can bound how long they wait.
pub trait ShardSource: Send + Sync + 'static {
    fn shard_id(&self) -> &ShardId;

    /// Reads up to `max_entries` entries positioned strictly after `after`.
    ///
    /// The batch's `applied_through` time is a promise that no entry at or before it will be
    /// appended later, which lets idle shards report progress. Fails with
    /// [`crate::error::ErrorKind::ShardUnavailable`] while the shard cannot be reached and with
    /// [`crate::error::ErrorKind::ChangeStreamHistoryLost`] once `after` was truncated away.
    fn read(
        &self,
        after: LogPosition,
        max_entries: usize,
    ) -> impl Future<Output = StreamResult<LogBatch>> + Send;

    /// Waits up to `timeout` for an entry after `after`. Returns `true` if one exists.
    fn wait_for_entries(
        &self,
        after: LogPosition,
        timeout: Duration,
    ) -> impl Future<Output = StreamResult<bool>> + Send;
}

/// Access to the cluster catalog and to the logs of its shards.
///
/// Cloned into every participant task of a stream.
pub trait ClusterConnector: Clone + Send + Sync + 'static {
    type Source: ShardSource;

    /// Opens the log of a shard that is still part of the cluster.
    fn connect(&self, shard: &ShardId) -> impl Future<Output = StreamResult<Self::Source>> + Send;

    /// Returns topology changes newer than `version`.
    fn topology_since(
        &self,
        version: TopologyVersion,
    ) -> impl Future<Output = StreamResult<TopologyUpdate>> + Send;

    /// Returns a consistent snapshot of shards, placement history and primaries.
    fn placement(&self) -> impl Future<Output = StreamResult<PlacementSnapshot>> + Send;

    fn feature_level(&self) -> impl Future<Output = StreamResult<FeatureLevel>> + Send;
}
