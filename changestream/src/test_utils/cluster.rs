use cluster::{ChunkBound, InMemoryCluster, LogicalTimestamp, Namespace, ShardId};
use config::shared::{MergerConfig, ReconnectionConfig, StreamServiceConfig, TopologyConfig};
use serde_json::{Value, json};

use crate::coordinator::{ChangeStream, ChangeStreamService};
use crate::error::StreamResult;
use crate::options::{ChangeStreamOptions, OpenRequest};
use crate::types::WatchScope;

pub const TEST_DATABASE: &str = "test";
pub const TEST_COLLECTION: &str = "coll";

pub fn test_namespace() -> Namespace {
    Namespace::new(TEST_DATABASE, TEST_COLLECTION)
}

pub fn shard(id: &str) -> ShardId {
    ShardId::new(id)
}

/// Service configuration with short intervals so that tests finish quickly.
pub fn fast_config() -> StreamServiceConfig {
    StreamServiceConfig {
        merger: MergerConfig {
            poll_interval_ms: 10,
            lag_threshold_ms: 200,
            max_stall_ms: None,
            participant_buffer_size: 64,
            read_batch_size: 16,
            removed_shard_grace_ms: 500,
        },
        reconnection: ReconnectionConfig {
            enabled: true,
            initial_retry_delay_ms: 10,
            max_retry_delay_ms: 50,
            backoff_multiplier: 2.0,
            max_attempts: 50,
        },
        topology: TopologyConfig {
            poll_interval_ms: 10,
        },
    }
}

/// A cluster with a change stream service on top of it.
#[derive(Debug, Clone)]
pub struct TestCluster {
    pub cluster: InMemoryCluster,
    pub service: ChangeStreamService<InMemoryCluster>,
}

impl TestCluster {
    pub fn new(shards: &[&str]) -> Self {
        Self::with_config(shards, fast_config())
    }

    pub fn with_config(shards: &[&str], config: StreamServiceConfig) -> Self {
        let cluster = InMemoryCluster::new(shards.iter().copied());
        let service = ChangeStreamService::new(cluster.clone(), config).unwrap();

        Self { cluster, service }
    }

    /// Shards `test.coll` at `_id == 0`: negative ids live on `low`, the rest on `high`.
    pub fn shard_test_collection(&self, low: &str, high: &str) {
        self.cluster
            .shard_collection(&test_namespace(), &[0], &[shard(low), shard(high)])
            .unwrap();
    }

    pub async fn open(&self, scope: WatchScope, options: ChangeStreamOptions) -> StreamResult<ChangeStream<InMemoryCluster>> {
        self.service
            .open(OpenRequest::new(scope).with_options(options))
            .await
    }

    /// Opens a stream on `test.coll` with default options.
    pub async fn watch_collection(&self) -> ChangeStream<InMemoryCluster> {
        self.open(WatchScope::collection(test_namespace()), ChangeStreamOptions::new())
            .await
            .unwrap()
    }

    pub fn insert(&self, id: i64) -> LogicalTimestamp {
        self.insert_document(json!({ "_id": id }))
    }

    pub fn insert_document(&self, document: Value) -> LogicalTimestamp {
        self.cluster.insert(&test_namespace(), document).unwrap()
    }

    /// Moves the chunk of `test.coll` starting at `_id == 0` to `to`.
    pub fn move_high_chunk(&self, to: &str) {
        self.cluster
            .move_chunk(&test_namespace(), ChunkBound::Key(0), &shard(to))
            .unwrap();
    }

    pub fn set_available(&self, id: &str, available: bool) {
        self.cluster.set_shard_available(&shard(id), available).unwrap();
    }
}

/// Shards `A` and `B` holding `test.coll` split at `_id == 0`, plus an empty shard `C`.
pub fn two_shard_cluster() -> TestCluster {
    let test_cluster = TestCluster::new(&["A", "B", "C"]);
    test_cluster.shard_test_collection("A", "B");

    test_cluster
}
