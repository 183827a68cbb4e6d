use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{LogicalTimestamp, Namespace, ShardId};

/// Monotonic version of the cluster's shard topology.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TopologyVersion(pub u64);

impl TopologyVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A single change to the set of shards or to data placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ShardDelta {
    Added {
        shard: ShardId,
    },
    Removed {
        shard: ShardId,
    },
    /// A chunk of `namespace` moved from `from` to `to`.
    Migrated {
        namespace: Namespace,
        from: ShardId,
        to: ShardId,
    },
    /// A collection was created with its data on `shard`.
    Placed {
        namespace: Namespace,
        shard: ShardId,
    },
}

impl fmt::Display for ShardDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardDelta::Added { shard } => write!(f, "added shard {shard}"),
            ShardDelta::Removed { shard } => write!(f, "removed shard {shard}"),
            ShardDelta::Migrated {
                namespace,
                from,
                to,
            } => write!(f, "migrated chunk of {namespace} from {from} to {to}"),
            ShardDelta::Placed { namespace, shard } => write!(f, "placed {namespace} on {shard}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyChange {
    pub version: TopologyVersion,
    /// Cluster time at which the change took effect.
    pub cluster_time: LogicalTimestamp,
    pub delta: ShardDelta,
}

/// Records that `shard` started holding data of `namespace` at `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub namespace: Namespace,
    pub shard: ShardId,
    pub since: LogicalTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRemoval {
    pub shard: ShardId,
    pub removed_at: LogicalTimestamp,
}

/// Topology changes newer than a known version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub version: TopologyVersion,
    pub changes: Vec<TopologyChange>,
    /// Every change that took effect at or before this time is included in `changes` or was
    /// already known to the caller.
    pub as_of: LogicalTimestamp,
}

/// Consistent view of where data lives, taken under a single catalog read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementSnapshot {
    pub shards: Vec<ShardId>,
    pub placement: Vec<PlacementEntry>,
    pub removed: Vec<ShardRemoval>,
    pub primaries: BTreeMap<String, ShardId>,
    pub default_primary: Option<ShardId>,
    pub topology_version: TopologyVersion,
    pub cluster_time: LogicalTimestamp,
}

impl PlacementSnapshot {
    pub fn contains_shard(&self, shard: &ShardId) -> bool {
        self.shards.contains(shard)
    }

    pub fn removal_of(&self, shard: &ShardId) -> Option<&ShardRemoval> {
        self.removed.iter().find(|removal| &removal.shard == shard)
    }
}

/// Compatibility level the cluster operates at.
///
/// Some change stream options are only accepted once every node runs at
/// [`FeatureLevel::Extended`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureLevel {
    Baseline,
    #[default]
    Extended,
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureLevel::Baseline => f.write_str("baseline"),
            FeatureLevel::Extended => f.write_str("extended"),
        }
    }
}
