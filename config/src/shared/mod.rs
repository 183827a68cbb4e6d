//! Shared configuration types for change stream services.

mod base;
mod merger;
mod reconnection;
mod server;
mod service;
mod topology;

pub use base::ValidationError;
pub use merger::MergerConfig;
pub use reconnection::ReconnectionConfig;
pub use server::ServerConfig;
pub use service::StreamServiceConfig;
pub use topology::TopologyConfig;
