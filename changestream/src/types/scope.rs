use std::fmt;

use cluster::{Namespace, is_control_database};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StreamResult};
use crate::types::{ChangeEvent, OperationType};

/// Set of namespaces a change stream observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WatchScope {
    Collection { namespace: Namespace },
    Database { db: String },
    Cluster,
}

impl WatchScope {
    pub fn collection(namespace: Namespace) -> Self {
        WatchScope::Collection { namespace }
    }

    pub fn database(db: impl Into<String>) -> Self {
        WatchScope::Database { db: db.into() }
    }

    /// Rejects scopes no stream can be opened on.
    pub fn validate(&self) -> StreamResult<()> {
        match self {
            WatchScope::Collection { namespace } => {
                if namespace.db.is_empty() || namespace.coll.is_empty() {
                    bail!(
                        ErrorKind::InvalidOptions,
                        "Collection scope requires a database and a collection name",
                        format!("got `{namespace}`")
                    );
                }
            }
            WatchScope::Database { db } => {
                if db.is_empty() {
                    bail!(ErrorKind::InvalidOptions, "Database scope requires a name");
                }
                if is_control_database(db) {
                    bail!(
                        ErrorKind::InvalidOptions,
                        "Control databases cannot be watched",
                        format!("database `{db}`")
                    );
                }
            }
            WatchScope::Cluster => {}
        }

        Ok(())
    }

    /// Returns `true` if data of `namespace` is observed by this scope.
    ///
    /// System collections only count when `show_system_events` is set, except for a collection
    /// scope naming one explicitly.
    pub fn includes_namespace(&self, namespace: &Namespace, show_system_events: bool) -> bool {
        match self {
            WatchScope::Collection { namespace: watched } => watched == namespace,
            WatchScope::Database { db } => {
                &namespace.db == db && (show_system_events || !namespace.is_system())
            }
            WatchScope::Cluster => {
                !namespace.is_in_control_database()
                    && (show_system_events || !namespace.is_system())
            }
        }
    }

    /// Returns `true` if a database level operation on `database` concerns this scope.
    pub fn includes_database(&self, database: &str) -> bool {
        match self {
            WatchScope::Collection { namespace } => namespace.db == database,
            WatchScope::Database { db } => db == database,
            WatchScope::Cluster => !is_control_database(database),
        }
    }

    /// Returns `true` if delivering `event` ends every stream on this scope.
    pub fn is_invalidated_by(&self, event: &ChangeEvent) -> bool {
        let Some(event_namespace) = &event.namespace else {
            return false;
        };

        match (self, event.operation_type) {
            (WatchScope::Collection { namespace }, OperationType::Drop) => {
                event_namespace.db == namespace.db
                    && event_namespace.coll.as_deref() == Some(namespace.coll.as_str())
            }
            (WatchScope::Collection { namespace }, OperationType::DropDatabase) => {
                event_namespace.db == namespace.db
            }
            (WatchScope::Database { db }, OperationType::DropDatabase) => &event_namespace.db == db,
            _ => false,
        }
    }

    /// Returns `true` if an event of `operation_type` that was delivered on this scope ended it.
    ///
    /// Streams only deliver drops of their own collection or database, so the type decides.
    pub fn is_invalidated_by_operation(&self, operation_type: OperationType) -> bool {
        matches!(
            (self, operation_type),
            (WatchScope::Collection { .. }, OperationType::Drop | OperationType::DropDatabase)
                | (WatchScope::Database { .. }, OperationType::DropDatabase)
        )
    }

    /// Database of the scope, if it is narrower than the cluster.
    pub fn database_name(&self) -> Option<&str> {
        match self {
            WatchScope::Collection { namespace } => Some(&namespace.db),
            WatchScope::Database { db } => Some(db),
            WatchScope::Cluster => None,
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::Collection { namespace } => write!(f, "collection {namespace}"),
            WatchScope::Database { db } => write!(f, "database {db}"),
            WatchScope::Cluster => f.write_str("cluster"),
        }
    }
}
