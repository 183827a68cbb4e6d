use std::fmt;

use cluster::{LogicalTimestamp, Namespace};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::token::ResumeToken;

/// Kind of change an event describes.
///
/// `Invalidate` and `RetryNeeded` are never read from a shard; the merger synthesizes them when
/// a stream has to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Drop,
    DropDatabase,
    Create,
    ShardCollection,
    Invalidate,
    RetryNeeded,
}

impl OperationType {
    /// Discriminant stored in version 2 resume tokens.
    pub const fn code(&self) -> u8 {
        match self {
            OperationType::Insert => 1,
            OperationType::Update => 2,
            OperationType::Delete => 3,
            OperationType::Drop => 4,
            OperationType::DropDatabase => 5,
            OperationType::Create => 6,
            OperationType::ShardCollection => 7,
            OperationType::Invalidate => 8,
            OperationType::RetryNeeded => 9,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationType::Insert),
            2 => Some(OperationType::Update),
            3 => Some(OperationType::Delete),
            4 => Some(OperationType::Drop),
            5 => Some(OperationType::DropDatabase),
            6 => Some(OperationType::Create),
            7 => Some(OperationType::ShardCollection),
            8 => Some(OperationType::Invalidate),
            9 => Some(OperationType::RetryNeeded),
            _ => None,
        }
    }

    /// Returns `true` for the events after which a stream is closed.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, OperationType::Invalidate | OperationType::RetryNeeded)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Create => "create",
            OperationType::ShardCollection => "shardCollection",
            OperationType::Invalidate => "invalidate",
            OperationType::RetryNeeded => "retryNeeded",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace of an event. `coll` is absent for database level events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNamespace {
    pub db: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coll: Option<String>,
}

impl EventNamespace {
    pub fn database(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: None,
        }
    }
}

impl From<&Namespace> for EventNamespace {
    fn from(namespace: &Namespace) -> Self {
        Self {
            db: namespace.db.clone(),
            coll: Some(namespace.coll.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    pub updated_fields: Map<String, Value>,
    pub removed_fields: Vec<String>,
}

/// A single change delivered to a consumer.
///
/// Optional fields are omitted from the serialized form when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "_id")]
    pub resume_token: ResumeToken,
    pub operation_type: OperationType,
    #[serde(rename = "ns", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<EventNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
    pub cluster_time: LogicalTimestamp,
    pub txn_index: u32,
}

impl ChangeEvent {
    pub fn is_terminal(&self) -> bool {
        self.operation_type.is_terminal()
    }
}
