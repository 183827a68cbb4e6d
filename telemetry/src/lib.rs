//! Tracing setup shared by change stream services and their tests.

pub mod tracing;
