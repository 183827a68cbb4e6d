use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{MergerConfig, ReconnectionConfig, TopologyConfig, ValidationError};

/// Top level configuration of a change stream service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamServiceConfig {
    #[serde(default)]
    pub merger: MergerConfig,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

impl StreamServiceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.merger.validate()?;
        self.reconnection.validate()?;
        self.topology.validate()
    }
}

impl Config for StreamServiceConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];

    fn validate(&self) -> Result<(), ValidationError> {
        StreamServiceConfig::validate(self)
    }
}
