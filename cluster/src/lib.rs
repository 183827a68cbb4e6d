//! In-process sharded document store.
//!
//! Provides the shard write logs, cluster clock and topology catalog that change streams read
//! from. [`InMemoryCluster`] is the entry point.

pub mod catalog;
pub mod clock;
pub mod error;
pub mod log;
pub mod memory;
pub mod types;

pub use catalog::{
    FeatureLevel, PlacementEntry, PlacementSnapshot, ShardDelta, ShardRemoval, TopologyChange,
    TopologyUpdate, TopologyVersion,
};
pub use clock::ClusterClock;
pub use error::ClusterError;
pub use log::{LogBatch, LogEntry, LogOperation, ShardLog};
pub use memory::{InMemoryCluster, WriteOp};
pub use types::{
    CONTROL_DATABASES, ChunkBound, ChunkRange, LogPosition, LogicalTimestamp, Namespace, ShardId,
    is_control_database,
};
