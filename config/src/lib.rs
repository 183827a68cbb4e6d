//! Configuration for the change stream service.
//!
//! Configuration is layered from `configuration/base.*`, `configuration/{environment}.*` and
//! `APP_`-prefixed environment variables, see [`load_config`].

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
