use thiserror::Error;

use crate::types::{ChunkBound, LogPosition, Namespace, ShardId};

/// Errors returned by cluster operations and shard log reads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Shard {0} is not part of the cluster")]
    ShardNotFound(ShardId),

    #[error("Shard {0} already exists")]
    ShardAlreadyExists(ShardId),

    #[error("Shard {0} is currently unavailable")]
    ShardUnavailable(ShardId),

    #[error("Shard {shard} still owns data for {namespace} and cannot be removed")]
    ShardNotDrained { shard: ShardId, namespace: String },

    #[error("The write log of shard {shard} no longer contains entries after {requested}")]
    HistoryLost {
        shard: ShardId,
        requested: LogPosition,
    },

    #[error("Invalid namespace '{0}'")]
    InvalidNamespace(String),

    #[error("Namespace {0} does not exist")]
    NamespaceNotFound(Namespace),

    #[error("Database {0} does not exist")]
    DatabaseNotFound(String),

    #[error("Collection {0} is already sharded")]
    AlreadySharded(Namespace),

    #[error("Collection {0} is not sharded")]
    NotSharded(Namespace),

    #[error("No chunk of {namespace} starts at {min}")]
    ChunkNotFound { namespace: Namespace, min: ChunkBound },

    #[error("Invalid split points for {namespace}: {reason}")]
    InvalidSplitPoints {
        namespace: Namespace,
        reason: &'static str,
    },

    #[error("Invalid document: {0}")]
    InvalidDocument(&'static str),

    #[error("Document with _id {id} already exists in {namespace}")]
    DuplicateKey { namespace: Namespace, id: i64 },

    #[error("Document with _id {id} does not exist in {namespace}")]
    DocumentNotFound { namespace: Namespace, id: i64 },

    #[error("Database {0} already exists")]
    DatabaseExists(String),

    #[error("Namespace {0} already exists")]
    NamespaceExists(Namespace),

    #[error("A transaction must contain at least one write")]
    EmptyTransaction,
}
