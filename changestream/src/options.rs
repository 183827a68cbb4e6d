//! Options accepted when opening a change stream.
//!
//! Every option is an `Option` so that an option set explicitly to its default value can be
//! told apart from one that was never set. Explicitly set options form the stream's shape.

use std::collections::BTreeMap;

use cluster::{FeatureLevel, LogicalTimestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversions::hash::stable_hash_json;
use crate::error::{ErrorKind, StreamResult};
use crate::token::{ResumeToken, TokenVersion};
use crate::types::{OperationType, WatchScope};

/// Options only accepted when the cluster runs at [`FeatureLevel::Extended`].
const GATED_OPTIONS: &[&str] = &["version", "supportedEvents", "ignoreRemovedShards"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangeStreamOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_after: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_time: Option<LogicalTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_expanded_events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_system_events: Option<bool>,
    /// Format of the resume tokens the stream produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<TokenVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_removed_shards: Option<bool>,
    /// Control events the consumer understands beyond `invalidate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_events: Option<Vec<OperationType>>,
}

impl ChangeStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }

    pub fn start_after(mut self, token: ResumeToken) -> Self {
        self.start_after = Some(token);
        self
    }

    pub fn start_at_time(mut self, cluster_time: LogicalTimestamp) -> Self {
        self.start_at_time = Some(cluster_time);
        self
    }

    pub fn show_expanded_events(mut self, show: bool) -> Self {
        self.show_expanded_events = Some(show);
        self
    }

    pub fn show_system_events(mut self, show: bool) -> Self {
        self.show_system_events = Some(show);
        self
    }

    pub fn token_version(mut self, version: TokenVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn ignore_removed_shards(mut self, ignore: bool) -> Self {
        self.ignore_removed_shards = Some(ignore);
        self
    }

    pub fn supported_events(mut self, events: Vec<OperationType>) -> Self {
        self.supported_events = Some(events);
        self
    }

    pub fn expanded_events(&self) -> bool {
        self.show_expanded_events.unwrap_or(false)
    }

    pub fn system_events(&self) -> bool {
        self.show_system_events.unwrap_or(false)
    }

    pub fn effective_token_version(&self) -> TokenVersion {
        self.version.unwrap_or_default()
    }

    pub fn ignores_removed_shards(&self) -> bool {
        self.ignore_removed_shards.unwrap_or(false)
    }

    /// Returns `true` if terminal topology changes are reported as `retryNeeded`.
    pub fn wants_retry_needed(&self) -> bool {
        self.supported_events
            .as_ref()
            .is_some_and(|events| events.contains(&OperationType::RetryNeeded))
    }

    /// Explicitly set options other than the start position, keyed by option name.
    pub fn shape(&self) -> BTreeMap<&'static str, Value> {
        let mut shape = BTreeMap::new();
        if let Some(show) = self.show_expanded_events {
            shape.insert("showExpandedEvents", Value::Bool(show));
        }
        if let Some(show) = self.show_system_events {
            shape.insert("showSystemEvents", Value::Bool(show));
        }
        if let Some(version) = self.version {
            shape.insert("version", Value::String(version.to_string()));
        }
        if let Some(ignore) = self.ignore_removed_shards {
            shape.insert("ignoreRemovedShards", Value::Bool(ignore));
        }
        if let Some(events) = &self.supported_events {
            let mut names = events.iter().map(|event| event.as_str()).collect::<Vec<_>>();
            names.sort_unstable();
            names.dedup();
            shape.insert(
                "supportedEvents",
                Value::Array(names.into_iter().map(Value::from).collect()),
            );
        }
        shape
    }

    /// Stable identity of the stream's shape.
    pub fn shape_id(&self, scope: &WatchScope) -> u64 {
        let shape = self
            .shape()
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect::<serde_json::Map<_, _>>();

        stable_hash_json(&serde_json::json!({
            "scope": scope.to_string(),
            "options": shape,
        }))
    }

    /// Rejects gated options the cluster cannot honor.
    pub fn validate(&self, feature_level: FeatureLevel) -> StreamResult<()> {
        if feature_level >= FeatureLevel::Extended {
            return Ok(());
        }

        let shape = self.shape();
        if let Some(option) = GATED_OPTIONS.iter().find(|option| shape.contains_key(*option)) {
            bail!(
                ErrorKind::UnsupportedOption,
                "Option requires a higher cluster feature level",
                format!("option `{option}` is not supported at feature level {feature_level}")
            );
        }

        Ok(())
    }
}

/// Request to open a change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub scope: WatchScope,
    #[serde(default)]
    pub options: ChangeStreamOptions,
}

impl OpenRequest {
    pub fn new(scope: WatchScope) -> Self {
        Self {
            scope,
            options: ChangeStreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChangeStreamOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_defaults_are_part_of_the_shape() {
        let unset = ChangeStreamOptions::new();
        let explicit = ChangeStreamOptions::new().show_expanded_events(false);

        assert!(unset.shape().is_empty());
        assert_eq!(
            explicit.shape().get("showExpandedEvents"),
            Some(&Value::Bool(false))
        );
        assert_eq!(unset.expanded_events(), explicit.expanded_events());

        let scope = WatchScope::Cluster;
        assert_ne!(unset.shape_id(&scope), explicit.shape_id(&scope));
    }

    #[test]
    fn shape_id_ignores_supported_events_order() {
        let scope = WatchScope::database("test");
        let a = ChangeStreamOptions::new()
            .supported_events(vec![OperationType::RetryNeeded, OperationType::Invalidate]);
        let b = ChangeStreamOptions::new()
            .supported_events(vec![OperationType::Invalidate, OperationType::RetryNeeded]);
        assert_eq!(a.shape_id(&scope), b.shape_id(&scope));
        assert_ne!(a.shape_id(&scope), a.shape_id(&WatchScope::Cluster));
    }

    #[test]
    fn gated_options_rejected_on_baseline() {
        let options = ChangeStreamOptions::new().ignore_removed_shards(false);
        let err = options.validate(FeatureLevel::Baseline).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOption);
        assert!(options.validate(FeatureLevel::Extended).is_ok());

        let options = ChangeStreamOptions::new().show_expanded_events(true);
        assert!(options.validate(FeatureLevel::Baseline).is_ok());
    }

    #[test]
    fn deserializes_camel_case() {
        let options: ChangeStreamOptions = serde_json::from_str(
            r#"{ "showExpandedEvents": true, "version": "v1", "supportedEvents": ["retryNeeded"] }"#,
        )
        .unwrap();

        assert!(options.expanded_events());
        assert_eq!(options.effective_token_version(), TokenVersion::V1);
        assert!(options.wants_retry_needed());
        assert!(serde_json::from_str::<ChangeStreamOptions>(r#"{ "unknown": 1 }"#).is_err());
    }
}
