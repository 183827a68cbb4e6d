//! Fixtures and helpers for testing change streams against an [`cluster::InMemoryCluster`].
//!
//! - [`cluster`] builds clusters with a sharded test collection and a service tuned for fast
//!   polling.
//! - [`event`] reads events from a stream with bounded waits.
//! - [`failpoints`] configures fail points for the duration of a test.

pub mod cluster;
pub mod event;
pub mod failpoints;
