use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{StreamServiceConfig, ValidationError};

/// Configuration of the change stream server binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shards of the in-process cluster the server streams from.
    pub shards: Vec<String>,

    /// Database to watch. The whole cluster is watched when unset.
    #[serde(default)]
    pub database: Option<String>,

    /// How long a single `next` call waits before the server polls again.
    ///
    /// Default: 1000
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default)]
    pub stream: StreamServiceConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.shards.is_empty() {
            return Err(ValidationError::invalid("shards", "must name at least one shard"));
        }
        if self.shards.iter().any(|shard| shard.is_empty()) {
            return Err(ValidationError::invalid("shards", "shard ids must not be empty"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ValidationError::invalid("poll_timeout_ms", "must be greater than 0"));
        }

        self.stream.validate()
    }
}

impl Config for ServerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["shards"];

    fn validate(&self) -> Result<(), ValidationError> {
        ServerConfig::validate(self)
    }
}

const fn default_poll_timeout_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_optional_fields() {
        let config: ServerConfig = serde_json::from_str(r#"{ "shards": ["a", "b"] }"#).unwrap();
        assert_eq!(config.poll_timeout_ms, 1000);
        assert_eq!(config.database, None);
        assert_eq!(config.stream, StreamServiceConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shards_are_required() {
        let config: ServerConfig = serde_json::from_str(r#"{ "shards": [] }"#).unwrap();
        assert!(config.validate().is_err());
        assert!(serde_json::from_str::<ServerConfig>("{}").is_err());
    }
}
