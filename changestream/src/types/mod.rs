mod event;
mod scope;

pub use event::{ChangeEvent, EventNamespace, OperationType, UpdateDescription};
pub use scope::WatchScope;

/// Unique identifier of an open change stream, used in logs.
pub type StreamId = uuid::Uuid;
