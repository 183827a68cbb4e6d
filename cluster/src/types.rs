use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Databases reserved for cluster bookkeeping.
///
/// Writes to these databases are never surfaced by cluster-wide change streams.
pub const CONTROL_DATABASES: &[&str] = &["admin", "config", "local"];

/// Prefix of collections that hold internal, per-database metadata.
const SYSTEM_COLLECTION_PREFIX: &str = "system.";

/// Returns `true` if `database` is one of the reserved control databases.
pub fn is_control_database(database: &str) -> bool {
    CONTROL_DATABASES.contains(&database)
}

/// Identifier of a shard in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ShardId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ShardId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Fully qualified collection name (`database.collection`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Returns `true` for collections holding internal metadata (`system.*`).
    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_COLLECTION_PREFIX)
    }

    /// Returns `true` if the namespace lives in one of the [`CONTROL_DATABASES`].
    pub fn is_in_control_database(&self) -> bool {
        is_control_database(&self.db)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(ClusterError::InvalidNamespace(s.to_owned())),
        }
    }
}

/// Hybrid logical timestamp shared by every shard of a cluster.
///
/// Ordering is on `secs` first and `inc` second, which is also the order in which the
/// cluster clock hands out timestamps.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTimestamp {
    #[serde(rename = "t")]
    pub secs: u32,
    #[serde(rename = "i")]
    pub inc: u32,
}

impl LogicalTimestamp {
    pub const MIN: LogicalTimestamp = LogicalTimestamp { secs: 0, inc: 0 };

    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Returns the timestamp handed out right after this one.
    pub fn successor(self) -> Self {
        match self.inc.checked_add(1) {
            Some(inc) => Self::new(self.secs, inc),
            None => Self::new(self.secs.saturating_add(1), 0),
        }
    }

    /// Returns the timestamp handed out right before this one, saturating at [`Self::MIN`].
    pub fn predecessor(self) -> Self {
        match self.inc.checked_sub(1) {
            Some(inc) => Self::new(self.secs, inc),
            None if self.secs == 0 => Self::MIN,
            None => Self::new(self.secs - 1, u32::MAX),
        }
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Position of an entry in a shard write log.
///
/// Entries written by the same commit share a cluster time and are distinguished by
/// `txn_index`, which is unique across all shards taking part in that commit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub cluster_time: LogicalTimestamp,
    pub txn_index: u32,
}

impl LogPosition {
    pub const fn new(cluster_time: LogicalTimestamp, txn_index: u32) -> Self {
        Self {
            cluster_time,
            txn_index,
        }
    }

    /// The position after which every entry has a cluster time of at least `cluster_time`.
    pub fn just_before(cluster_time: LogicalTimestamp) -> Self {
        if cluster_time == LogicalTimestamp::MIN {
            return Self::new(LogicalTimestamp::MIN, 0);
        }

        Self::new(cluster_time.predecessor(), u32::MAX)
    }

    /// The last position that can exist at `cluster_time`.
    pub fn end_of(cluster_time: LogicalTimestamp) -> Self {
        Self::new(cluster_time, u32::MAX)
    }

    /// The greatest position ordered before `self`. Saturates at the minimum position.
    pub fn predecessor(self) -> Self {
        match self.txn_index {
            0 => Self::just_before(self.cluster_time),
            txn_index => Self::new(self.cluster_time, txn_index - 1),
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cluster_time, self.txn_index)
    }
}

/// Bound of a chunk range on the integer shard key (`_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkBound {
    MinKey,
    Key(i64),
    MaxKey,
}

impl fmt::Display for ChunkBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkBound::MinKey => f.write_str("MinKey"),
            ChunkBound::Key(key) => write!(f, "{key}"),
            ChunkBound::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// Half-open key range `[min, max)` owned by exactly one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: ChunkBound,
    pub max: ChunkBound,
}

impl ChunkRange {
    pub fn new(min: ChunkBound, max: ChunkBound) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, key: i64) -> bool {
        let key = ChunkBound::Key(key);
        self.min <= key && key < self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_parsing() {
        let ns: Namespace = "test.coll".parse().unwrap();
        assert_eq!(ns, Namespace::new("test", "coll"));
        assert_eq!(ns.to_string(), "test.coll");

        let dotted: Namespace = "test.system.views".parse().unwrap();
        assert_eq!(dotted.coll, "system.views");
        assert!(dotted.is_system());

        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }

    #[test]
    fn timestamp_neighbours() {
        let ts = LogicalTimestamp::new(5, 0);
        assert_eq!(ts.predecessor(), LogicalTimestamp::new(4, u32::MAX));
        assert_eq!(ts.predecessor().successor(), ts);
        assert_eq!(LogicalTimestamp::MIN.predecessor(), LogicalTimestamp::MIN);
    }

    #[test]
    fn just_before_precedes_every_entry_at_time() {
        let ts = LogicalTimestamp::new(7, 3);
        let before = LogPosition::just_before(ts);
        assert!(before < LogPosition::new(ts, 0));
        assert!(before > LogPosition::end_of(LogicalTimestamp::new(7, 1)));
    }

    #[test]
    fn position_predecessor() {
        let ts = LogicalTimestamp::new(7, 3);
        assert_eq!(LogPosition::new(ts, 2).predecessor(), LogPosition::new(ts, 1));
        assert_eq!(LogPosition::new(ts, 0).predecessor(), LogPosition::just_before(ts));
        assert_eq!(LogPosition::default().predecessor(), LogPosition::default());
    }

    #[test]
    fn chunk_bounds_order_and_containment() {
        assert!(ChunkBound::MinKey < ChunkBound::Key(i64::MIN));
        assert!(ChunkBound::Key(i64::MAX) < ChunkBound::MaxKey);

        let range = ChunkRange::new(ChunkBound::MinKey, ChunkBound::Key(0));
        assert!(range.contains(-1));
        assert!(!range.contains(0));
    }
}
