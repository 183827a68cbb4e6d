use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::catalog::{
    FeatureLevel, PlacementEntry, PlacementSnapshot, ShardDelta, ShardRemoval, TopologyChange,
    TopologyUpdate, TopologyVersion,
};
use crate::clock::ClusterClock;
use crate::error::ClusterError;
use crate::log::{LogOperation, ShardLog, ShardLogWriter};
use crate::types::{ChunkBound, ChunkRange, LogPosition, LogicalTimestamp, Namespace, ShardId};

/// A user write routed to the shard owning the affected document.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        namespace: Namespace,
        document: Value,
    },
    Update {
        namespace: Namespace,
        id: i64,
        set: Map<String, Value>,
        unset: Vec<String>,
    },
    Delete {
        namespace: Namespace,
        id: i64,
    },
}

impl WriteOp {
    pub fn namespace(&self) -> &Namespace {
        match self {
            WriteOp::Insert { namespace, .. }
            | WriteOp::Update { namespace, .. }
            | WriteOp::Delete { namespace, .. } => namespace,
        }
    }
}

#[derive(Debug, Clone)]
struct Chunk {
    range: ChunkRange,
    owner: ShardId,
}

#[derive(Debug, Default)]
struct Collection {
    /// `None` while the collection is unsharded and lives on the database primary.
    chunks: Option<Vec<Chunk>>,
    documents: BTreeMap<i64, Value>,
}

#[derive(Debug)]
struct RemovedShard {
    log: ShardLog,
    removed_at: LogicalTimestamp,
}

#[derive(Debug, Default)]
struct ClusterState {
    shards: BTreeMap<ShardId, ShardLog>,
    removed: BTreeMap<ShardId, RemovedShard>,
    databases: BTreeMap<String, ShardId>,
    collections: BTreeMap<Namespace, Collection>,
    placement: Vec<PlacementEntry>,
    topology: Vec<TopologyChange>,
    version: TopologyVersion,
    feature_level: FeatureLevel,
}

impl ClusterState {
    fn log(&self, shard: &ShardId) -> Result<&ShardLog, ClusterError> {
        self.shards
            .get(shard)
            .ok_or_else(|| ClusterError::ShardNotFound(shard.clone()))
    }

    fn default_primary(&self) -> Result<ShardId, ClusterError> {
        self.shards
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| ClusterError::ShardNotFound(ShardId::new("<none>")))
    }

    fn primary_of(&self, database: &str) -> Result<&ShardId, ClusterError> {
        self.databases
            .get(database)
            .ok_or_else(|| ClusterError::DatabaseNotFound(database.to_owned()))
    }

    /// Shard currently owning `id` in `namespace`.
    fn route(&self, namespace: &Namespace, id: i64) -> Result<ShardId, ClusterError> {
        let collection = self
            .collections
            .get(namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(namespace.clone()))?;

        match &collection.chunks {
            Some(chunks) => chunks
                .iter()
                .find(|chunk| chunk.range.contains(id))
                .map(|chunk| chunk.owner.clone())
                .ok_or_else(|| ClusterError::NamespaceNotFound(namespace.clone())),
            None => self.primary_of(&namespace.db).cloned(),
        }
    }

    /// Shards holding any data of `namespace`, in shard order.
    fn owners(&self, namespace: &Namespace) -> Result<BTreeSet<ShardId>, ClusterError> {
        let collection = self
            .collections
            .get(namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(namespace.clone()))?;

        match &collection.chunks {
            Some(chunks) => Ok(chunks.iter().map(|chunk| chunk.owner.clone()).collect()),
            None => Ok(BTreeSet::from([self.primary_of(&namespace.db)?.clone()])),
        }
    }

    fn record_placement(&mut self, namespace: &Namespace, shard: &ShardId, since: LogicalTimestamp) {
        let known = self
            .placement
            .iter()
            .any(|entry| &entry.namespace == namespace && &entry.shard == shard);
        if !known {
            self.placement.push(PlacementEntry {
                namespace: namespace.clone(),
                shard: shard.clone(),
                since,
            });
        }
    }

    fn record_topology_change(&mut self, cluster_time: LogicalTimestamp, delta: ShardDelta) -> TopologyVersion {
        self.version = self.version.next();
        info!(version = %self.version, %cluster_time, %delta, "topology changed");
        self.topology.push(TopologyChange {
            version: self.version,
            cluster_time,
            delta,
        });
        self.version
    }
}

#[derive(Debug)]
struct ClusterInner {
    clock: ClusterClock,
    state: Mutex<ClusterState>,
}

/// In-process sharded document store.
///
/// Every shard owns an append-only [`ShardLog`]; all shards share one [`ClusterClock`]. Each
/// commit holds the log locks of every shard it writes to, in shard order, while it ticks the
/// clock, which makes a log's `applied_through` time a valid lower bound for its next entry.
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl InMemoryCluster {
    /// Creates a cluster with the given shards. The smallest shard id becomes the default
    /// primary of new databases.
    pub fn new<I, S>(shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ShardId>,
    {
        let clock = ClusterClock::new();
        let shards = shards
            .into_iter()
            .map(|shard| {
                let shard = shard.into();
                let log = ShardLog::new(shard.clone(), clock.clone());
                (shard, log)
            })
            .collect();

        Self {
            inner: Arc::new(ClusterInner {
                clock,
                state: Mutex::new(ClusterState {
                    shards,
                    ..ClusterState::default()
                }),
            }),
        }
    }

    /// Last cluster time handed out by the clock.
    pub fn cluster_time(&self) -> LogicalTimestamp {
        self.inner.clock.now()
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.lock_state().feature_level
    }

    pub fn set_feature_level(&self, level: FeatureLevel) {
        info!(%level, "setting cluster feature level");
        self.lock_state().feature_level = level;
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.lock_state().shards.keys().cloned().collect()
    }

    /// Returns the write log of a shard that is currently part of the cluster.
    pub fn shard_log(&self, shard: &ShardId) -> Result<ShardLog, ClusterError> {
        self.lock_state().log(shard).cloned()
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.lock_state().version
    }

    /// Returns every topology change with a version greater than `version`.
    pub fn topology_changes_since(&self, version: TopologyVersion) -> Vec<TopologyChange> {
        self.lock_state()
            .topology
            .iter()
            .filter(|change| change.version > version)
            .cloned()
            .collect()
    }

    /// Returns the changes newer than `version` together with the cluster time they are
    /// complete through.
    ///
    /// Topology changes are recorded under the catalog lock at the time they tick the clock,
    /// so reading the clock under the same lock bounds what a later poll can still reveal.
    pub fn topology_since(&self, version: TopologyVersion) -> TopologyUpdate {
        let state = self.lock_state();
        let changes = state
            .topology
            .iter()
            .filter(|change| change.version > version)
            .cloned()
            .collect();

        TopologyUpdate {
            version: state.version,
            changes,
            as_of: self.inner.clock.now(),
        }
    }

    /// Returns shards, placement history, removals and primaries as of one instant.
    pub fn placement_snapshot(&self) -> PlacementSnapshot {
        let state = self.lock_state();

        PlacementSnapshot {
            shards: state.shards.keys().cloned().collect(),
            placement: state.placement.clone(),
            removed: state
                .removed
                .iter()
                .map(|(shard, removed)| ShardRemoval {
                    shard: shard.clone(),
                    removed_at: removed.removed_at,
                })
                .collect(),
            primaries: state.databases.clone(),
            default_primary: state.default_primary().ok(),
            topology_version: state.version,
            cluster_time: self.inner.clock.now(),
        }
    }

    pub fn placement_history(&self) -> Vec<PlacementEntry> {
        self.lock_state().placement.clone()
    }

    pub fn removed_shards(&self) -> Vec<ShardRemoval> {
        self.lock_state()
            .removed
            .iter()
            .map(|(shard, removed)| ShardRemoval {
                shard: shard.clone(),
                removed_at: removed.removed_at,
            })
            .collect()
    }

    pub fn database_primary(&self, database: &str) -> Option<ShardId> {
        self.lock_state().databases.get(database).cloned()
    }

    /// Shard that becomes primary of databases created implicitly.
    pub fn default_primary(&self) -> Option<ShardId> {
        self.lock_state().default_primary().ok()
    }

    pub fn find(&self, namespace: &Namespace, id: i64) -> Option<Value> {
        self.lock_state()
            .collections
            .get(namespace)
            .and_then(|collection| collection.documents.get(&id).cloned())
    }

    pub fn owning_shard(&self, namespace: &Namespace, id: i64) -> Result<ShardId, ClusterError> {
        self.lock_state().route(namespace, id)
    }

    pub fn add_shard(&self, shard: impl Into<ShardId>) -> Result<TopologyVersion, ClusterError> {
        let shard = shard.into();
        let mut state = self.lock_state();
        if state.shards.contains_key(&shard) || state.removed.contains_key(&shard) {
            return Err(ClusterError::ShardAlreadyExists(shard));
        }

        let at = self.inner.clock.tick();
        state
            .shards
            .insert(shard.clone(), ShardLog::new(shard.clone(), self.inner.clock.clone()));

        Ok(state.record_topology_change(at, ShardDelta::Added { shard }))
    }

    /// Removes a drained shard from the cluster.
    ///
    /// The shard's log stays readable through handles obtained before the removal.
    pub fn remove_shard(&self, shard: &ShardId) -> Result<TopologyVersion, ClusterError> {
        let mut state = self.lock_state();
        state.log(shard)?;

        for (namespace, collection) in &state.collections {
            let owns_data = match &collection.chunks {
                Some(chunks) => chunks.iter().any(|chunk| &chunk.owner == shard),
                None => state.databases.get(&namespace.db) == Some(shard),
            };
            if owns_data {
                return Err(ClusterError::ShardNotDrained {
                    shard: shard.clone(),
                    namespace: namespace.to_string(),
                });
            }
        }
        if let Some((database, _)) = state.databases.iter().find(|(_, primary)| *primary == shard) {
            return Err(ClusterError::ShardNotDrained {
                shard: shard.clone(),
                namespace: database.clone(),
            });
        }

        let removed_at = self.inner.clock.tick();
        if let Some(log) = state.shards.remove(shard) {
            state.removed.insert(shard.clone(), RemovedShard { log, removed_at });
        }

        Ok(state.record_topology_change(removed_at, ShardDelta::Removed { shard: shard.clone() }))
    }

    /// Creates `database` with an explicit primary shard.
    pub fn create_database(&self, database: &str, primary: &ShardId) -> Result<(), ClusterError> {
        let mut state = self.lock_state();
        if state.databases.contains_key(database) {
            return Err(ClusterError::DatabaseExists(database.to_owned()));
        }
        state.log(primary)?;

        debug!(database, %primary, "creating database");
        state.databases.insert(database.to_owned(), primary.clone());

        Ok(())
    }

    pub fn create_collection(&self, namespace: &Namespace) -> Result<LogicalTimestamp, ClusterError> {
        let mut state = self.lock_state();
        if state.collections.contains_key(namespace) {
            return Err(ClusterError::NamespaceExists(namespace.clone()));
        }

        self.create_collection_locked(&mut state, namespace)
    }

    pub fn insert(&self, namespace: &Namespace, document: Value) -> Result<LogicalTimestamp, ClusterError> {
        self.transaction(vec![WriteOp::Insert {
            namespace: namespace.clone(),
            document,
        }])
    }

    /// Sets and unsets top level fields of the document with `_id == id`.
    pub fn update(
        &self,
        namespace: &Namespace,
        id: i64,
        set: Map<String, Value>,
        unset: Vec<String>,
    ) -> Result<LogicalTimestamp, ClusterError> {
        self.transaction(vec![WriteOp::Update {
            namespace: namespace.clone(),
            id,
            set,
            unset,
        }])
    }

    pub fn delete(&self, namespace: &Namespace, id: i64) -> Result<LogicalTimestamp, ClusterError> {
        self.transaction(vec![WriteOp::Delete {
            namespace: namespace.clone(),
            id,
        }])
    }

    /// Commits `writes` atomically.
    ///
    /// All entries share one cluster time. Each entry gets a distinct `txn_index` following
    /// the order of `writes`, also when the writes land on different shards.
    pub fn transaction(&self, writes: Vec<WriteOp>) -> Result<LogicalTimestamp, ClusterError> {
        if writes.is_empty() {
            return Err(ClusterError::EmptyTransaction);
        }

        let mut state = self.lock_state();
        for write in &writes {
            if !state.collections.contains_key(write.namespace()) {
                self.create_collection_locked(&mut state, write.namespace())?;
            }
        }

        let mut staged: BTreeMap<(Namespace, i64), Option<Value>> = BTreeMap::new();
        let mut entries = Vec::with_capacity(writes.len());
        for write in writes {
            let (shard, operation) = Self::stage_write(&state, &mut staged, write)?;
            entries.push((shard, operation, false));
        }

        let committed_at = self.commit(&state, entries)?;

        for ((namespace, id), document) in staged {
            if let Some(collection) = state.collections.get_mut(&namespace) {
                match document {
                    Some(document) => collection.documents.insert(id, document),
                    None => collection.documents.remove(&id),
                };
            }
        }

        Ok(committed_at)
    }

    /// Shards `namespace` on `_id`.
    ///
    /// `split_points` must be strictly increasing and `owners` must name one shard per
    /// resulting chunk. Chunks not owned by the primary are migrated after the split.
    pub fn shard_collection(
        &self,
        namespace: &Namespace,
        split_points: &[i64],
        owners: &[ShardId],
    ) -> Result<TopologyVersion, ClusterError> {
        if owners.len() != split_points.len() + 1 {
            return Err(ClusterError::InvalidSplitPoints {
                namespace: namespace.clone(),
                reason: "expected exactly one owner per chunk",
            });
        }
        if split_points.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ClusterError::InvalidSplitPoints {
                namespace: namespace.clone(),
                reason: "split points must be strictly increasing",
            });
        }

        let mut state = self.lock_state();
        for owner in owners {
            state.log(owner)?;
        }
        if !state.collections.contains_key(namespace) {
            self.create_collection_locked(&mut state, namespace)?;
        }
        if state
            .collections
            .get(namespace)
            .is_some_and(|collection| collection.chunks.is_some())
        {
            return Err(ClusterError::AlreadySharded(namespace.clone()));
        }

        let primary = state.primary_of(&namespace.db)?.clone();
        self.commit(
            &state,
            vec![(
                primary.clone(),
                LogOperation::ShardCollection {
                    namespace: namespace.clone(),
                },
                false,
            )],
        )?;

        let bounds = std::iter::once(ChunkBound::MinKey)
            .chain(split_points.iter().copied().map(ChunkBound::Key))
            .chain(std::iter::once(ChunkBound::MaxKey))
            .collect::<Vec<_>>();
        let chunks = bounds
            .windows(2)
            .map(|pair| Chunk {
                range: ChunkRange::new(pair[0], pair[1]),
                owner: primary.clone(),
            })
            .collect();
        if let Some(collection) = state.collections.get_mut(namespace) {
            collection.chunks = Some(chunks);
        }

        for (min, owner) in bounds.iter().zip(owners) {
            if owner != &primary {
                self.move_chunk_locked(&mut state, namespace, *min, owner)?;
            }
        }

        Ok(state.version)
    }

    /// Migrates the chunk of `namespace` starting at `min` to `to`.
    pub fn move_chunk(
        &self,
        namespace: &Namespace,
        min: ChunkBound,
        to: &ShardId,
    ) -> Result<TopologyVersion, ClusterError> {
        let mut state = self.lock_state();
        self.move_chunk_locked(&mut state, namespace, min, to)
    }

    pub fn drop_collection(&self, namespace: &Namespace) -> Result<LogicalTimestamp, ClusterError> {
        let mut state = self.lock_state();
        let entries = state
            .owners(namespace)?
            .into_iter()
            .map(|shard| {
                let operation = LogOperation::Drop {
                    namespace: namespace.clone(),
                };
                (shard, operation, false)
            })
            .collect();

        let dropped_at = self.commit(&state, entries)?;
        state.collections.remove(namespace);

        Ok(dropped_at)
    }

    /// Drops every collection of `database` and then the database itself, in one commit.
    pub fn drop_database(&self, database: &str) -> Result<LogicalTimestamp, ClusterError> {
        let mut state = self.lock_state();
        let primary = state.primary_of(database)?.clone();

        let namespaces = state
            .collections
            .keys()
            .filter(|namespace| namespace.db == database)
            .cloned()
            .collect::<Vec<_>>();

        let mut entries = Vec::new();
        for namespace in &namespaces {
            for shard in state.owners(namespace)? {
                let operation = LogOperation::Drop {
                    namespace: namespace.clone(),
                };
                entries.push((shard, operation, false));
            }
        }
        entries.push((
            primary,
            LogOperation::DropDatabase {
                database: database.to_owned(),
            },
            false,
        ));

        let dropped_at = self.commit(&state, entries)?;
        for namespace in namespaces {
            state.collections.remove(&namespace);
        }
        state.databases.remove(database);

        Ok(dropped_at)
    }

    /// Appends a no-op entry to `shard`'s log.
    pub fn write_noop(&self, shard: &ShardId) -> Result<LogicalTimestamp, ClusterError> {
        let state = self.lock_state();
        self.commit(&state, vec![(shard.clone(), LogOperation::Noop, false)])
    }

    pub fn set_shard_available(&self, shard: &ShardId, available: bool) -> Result<(), ClusterError> {
        let state = self.lock_state();
        let log = match state.shards.get(shard) {
            Some(log) => log,
            None => state
                .removed
                .get(shard)
                .map(|removed| &removed.log)
                .ok_or_else(|| ClusterError::ShardNotFound(shard.clone()))?,
        };
        log.set_available(available);

        Ok(())
    }

    /// Discards the entries of `shard` written at or before `through`.
    pub fn truncate_log(&self, shard: &ShardId, through: LogicalTimestamp) -> Result<(), ClusterError> {
        let state = self.lock_state();
        state.log(shard)?.truncate_through(LogPosition::end_of(through));

        Ok(())
    }

    fn create_collection_locked(
        &self,
        state: &mut ClusterState,
        namespace: &Namespace,
    ) -> Result<LogicalTimestamp, ClusterError> {
        let primary = match state.databases.get(&namespace.db) {
            Some(primary) => primary.clone(),
            None => {
                let primary = state.default_primary()?;
                state.databases.insert(namespace.db.clone(), primary.clone());
                primary
            }
        };

        let created_at = self.commit(
            state,
            vec![(
                primary.clone(),
                LogOperation::Create {
                    namespace: namespace.clone(),
                },
                false,
            )],
        )?;

        debug!(%namespace, %primary, %created_at, "created collection");
        state
            .collections
            .insert(namespace.clone(), Collection::default());
        state.record_placement(namespace, &primary, created_at);
        state.record_topology_change(
            created_at,
            ShardDelta::Placed {
                namespace: namespace.clone(),
                shard: primary,
            },
        );

        Ok(created_at)
    }

    fn move_chunk_locked(
        &self,
        state: &mut ClusterState,
        namespace: &Namespace,
        min: ChunkBound,
        to: &ShardId,
    ) -> Result<TopologyVersion, ClusterError> {
        state.log(to)?;

        let collection = state
            .collections
            .get(namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(namespace.clone()))?;
        let chunks = collection
            .chunks
            .as_ref()
            .ok_or_else(|| ClusterError::NotSharded(namespace.clone()))?;
        let (index, chunk) = chunks
            .iter()
            .enumerate()
            .find(|(_, chunk)| chunk.range.min == min)
            .ok_or_else(|| ClusterError::ChunkNotFound {
                namespace: namespace.clone(),
                min,
            })?;

        let from = chunk.owner.clone();
        if &from == to {
            return Ok(state.version);
        }

        let moved = collection
            .documents
            .iter()
            .filter(|(id, _)| chunk.range.contains(**id))
            .map(|(id, document)| (*id, document.clone()))
            .collect::<Vec<_>>();

        let mut entries = Vec::with_capacity(moved.len() * 2);
        for (_, document) in &moved {
            let operation = LogOperation::Insert {
                namespace: namespace.clone(),
                document: document.clone(),
            };
            entries.push((to.clone(), operation, true));
        }
        for (id, _) in &moved {
            let operation = LogOperation::Delete {
                namespace: namespace.clone(),
                document_key: json!({ "_id": id }),
            };
            entries.push((from.clone(), operation, true));
        }

        let migrated_at = self.commit(state, entries)?;
        info!(%namespace, range = %chunk.range, %from, %to, documents = moved.len(), "migrated chunk");

        if let Some(chunks) = state
            .collections
            .get_mut(namespace)
            .and_then(|collection| collection.chunks.as_mut())
        {
            chunks[index].owner = to.clone();
        }
        state.record_placement(namespace, to, migrated_at);

        Ok(state.record_topology_change(
            migrated_at,
            ShardDelta::Migrated {
                namespace: namespace.clone(),
                from,
                to: to.clone(),
            },
        ))
    }

    /// Validates `write` against current and staged documents and returns the entry it logs.
    fn stage_write(
        state: &ClusterState,
        staged: &mut BTreeMap<(Namespace, i64), Option<Value>>,
        write: WriteOp,
    ) -> Result<(ShardId, LogOperation), ClusterError> {
        let current = |namespace: &Namespace, id: i64, staged: &BTreeMap<(Namespace, i64), Option<Value>>| {
            match staged.get(&(namespace.clone(), id)) {
                Some(document) => document.clone(),
                None => state
                    .collections
                    .get(namespace)
                    .and_then(|collection| collection.documents.get(&id).cloned()),
            }
        };

        match write {
            WriteOp::Insert {
                namespace,
                document,
            } => {
                let id = document_id(&document)?;
                if current(&namespace, id, staged).is_some() {
                    return Err(ClusterError::DuplicateKey { namespace, id });
                }

                let shard = state.route(&namespace, id)?;
                staged.insert((namespace.clone(), id), Some(document.clone()));

                Ok((shard, LogOperation::Insert { namespace, document }))
            }
            WriteOp::Update {
                namespace,
                id,
                set,
                unset,
            } => {
                let Some(mut document) = current(&namespace, id, staged) else {
                    return Err(ClusterError::DocumentNotFound { namespace, id });
                };
                if set.contains_key("_id") || unset.iter().any(|field| field == "_id") {
                    return Err(ClusterError::InvalidDocument("_id cannot be modified"));
                }

                if let Some(fields) = document.as_object_mut() {
                    for (field, value) in &set {
                        fields.insert(field.clone(), value.clone());
                    }
                    for field in &unset {
                        fields.remove(field);
                    }
                }

                let shard = state.route(&namespace, id)?;
                staged.insert((namespace.clone(), id), Some(document));

                Ok((
                    shard,
                    LogOperation::Update {
                        namespace,
                        document_key: json!({ "_id": id }),
                        updated_fields: set,
                        removed_fields: unset,
                    },
                ))
            }
            WriteOp::Delete { namespace, id } => {
                if current(&namespace, id, staged).is_none() {
                    return Err(ClusterError::DocumentNotFound { namespace, id });
                }

                let shard = state.route(&namespace, id)?;
                staged.insert((namespace.clone(), id), None);

                Ok((
                    shard,
                    LogOperation::Delete {
                        namespace,
                        document_key: json!({ "_id": id }),
                    },
                ))
            }
        }
    }

    /// Appends `entries` under a single new cluster time.
    ///
    /// The logs of all involved shards are locked in shard order before the clock ticks and
    /// stay locked until every entry is appended.
    fn commit(
        &self,
        state: &ClusterState,
        entries: Vec<(ShardId, LogOperation, bool)>,
    ) -> Result<LogicalTimestamp, ClusterError> {
        let involved = entries
            .iter()
            .map(|(shard, _, _)| shard.clone())
            .collect::<BTreeSet<_>>();

        let mut writers: BTreeMap<ShardId, ShardLogWriter<'_>> = BTreeMap::new();
        for shard in involved {
            let writer = state.log(&shard)?.writer();
            writers.insert(shard, writer);
        }

        let committed_at = self.inner.clock.tick();
        for (txn_index, (shard, operation, from_migrate)) in entries.into_iter().enumerate() {
            if let Some(writer) = writers.get_mut(&shard) {
                writer.append(
                    LogPosition::new(committed_at, txn_index as u32),
                    operation,
                    from_migrate,
                );
            }
        }

        Ok(committed_at)
    }

    fn lock_state(&self) -> MutexGuard<'_, ClusterState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn document_id(document: &Value) -> Result<i64, ClusterError> {
    let fields = document
        .as_object()
        .ok_or(ClusterError::InvalidDocument("documents must be objects"))?;

    fields
        .get("_id")
        .and_then(Value::as_i64)
        .ok_or(ClusterError::InvalidDocument("documents need an integer _id"))
}
