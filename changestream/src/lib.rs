//! Change streams over a sharded document store.
//!
//! A stream watches a collection, a database or the whole cluster and delivers every change in
//! cluster time order, merged across the shards holding data in scope. Streams survive chunk
//! migrations between the shards they read, end with an `invalidate` event when data moves
//! elsewhere, and can be continued from the resume token of any delivered event.
//!
//! Entry point is [`coordinator::ChangeStreamService`], which opens
//! [`coordinator::ChangeStream`] cursors through a [`source::ClusterConnector`].

pub mod adapter;
pub mod concurrency;
pub mod conversions;
pub mod coordinator;
pub mod error;
pub mod failpoints;
#[macro_use]
mod macros;
pub mod merger;
pub mod metrics;
pub mod options;
pub mod reconnect;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod token;
pub mod topology;
pub mod types;
