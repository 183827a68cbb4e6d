//! [`ClusterConnector`] and [`ShardSource`] for the in-process [`InMemoryCluster`].

use std::time::Duration;

use cluster::{
    FeatureLevel, InMemoryCluster, LogBatch, LogPosition, PlacementSnapshot, ShardId, ShardLog,
    TopologyUpdate, TopologyVersion,
};

use crate::error::{StreamError, StreamResult};
use crate::source::{ClusterConnector, ShardSource};

impl ShardSource for ShardLog {
    fn shard_id(&self) -> &ShardId {
        ShardLog::shard_id(self)
    }

    async fn read(&self, after: LogPosition, max_entries: usize) -> StreamResult<LogBatch> {
        self.read_after(after, max_entries)
            .map_err(|err| StreamError::from(err).with_shard(ShardLog::shard_id(self)))
    }

    async fn wait_for_entries(&self, after: LogPosition, timeout: Duration) -> StreamResult<bool> {
        Ok(self.wait_for_entries_after(after, timeout).await)
    }
}

impl ClusterConnector for InMemoryCluster {
    type Source = ShardLog;

    async fn connect(&self, shard: &ShardId) -> StreamResult<ShardLog> {
        Ok(self.shard_log(shard)?)
    }

    async fn topology_since(&self, version: TopologyVersion) -> StreamResult<TopologyUpdate> {
        Ok(InMemoryCluster::topology_since(self, version))
    }

    async fn placement(&self) -> StreamResult<PlacementSnapshot> {
        Ok(self.placement_snapshot())
    }

    async fn feature_level(&self) -> StreamResult<FeatureLevel> {
        Ok(InMemoryCluster::feature_level(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use cluster::Namespace;
    use serde_json::json;

    #[tokio::test]
    async fn unavailable_shard_reports_transient_error() {
        let cluster = InMemoryCluster::new(["A"]);
        let source = cluster.connect(&ShardId::new("A")).await.unwrap();
        cluster.set_shard_available(&ShardId::new("A"), false).unwrap();

        let err = source.read(LogPosition::default(), 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShardUnavailable);
        assert!(err.kind().is_transient());
        assert_eq!(err.shard(), Some(&ShardId::new("A")));
    }

    #[tokio::test]
    async fn removed_shard_cannot_be_connected() {
        let cluster = InMemoryCluster::new(["A", "B"]);
        cluster.remove_shard(&ShardId::new("B")).unwrap();

        let err = cluster.connect(&ShardId::new("B")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShardRemoved);
    }

    #[tokio::test]
    async fn truncated_history_is_reported() {
        let cluster = InMemoryCluster::new(["A"]);
        let namespace = Namespace::new("test", "coll");
        let first = cluster.insert(&namespace, json!({ "_id": 1 })).unwrap();
        cluster.insert(&namespace, json!({ "_id": 2 })).unwrap();
        cluster.truncate_log(&ShardId::new("A"), first).unwrap();

        let source = cluster.connect(&ShardId::new("A")).await.unwrap();
        let err = source.read(LogPosition::default(), 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChangeStreamHistoryLost);

        let batch = source.read(LogPosition::end_of(first), 10).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
    }
}
