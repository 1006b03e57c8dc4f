//! Observer configuration.
//!
//! Configuration is plain data so hosts can keep it next to the rest of
//! their settings. Every field has a default; an empty JSON object is a valid
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where a subscription runs its fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// On tokio's blocking pool, keeping store latency off the async workers.
    #[default]
    Blocking,

    /// Directly on the subscription task. Only for stores whose fetches
    /// never block.
    Inline,
}

/// Settings applied to every subscription an observer starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverConfig {
    /// Recorded on the subscription's tracing span.
    pub label: Option<String>,

    /// Where fetches run.
    pub fetch_mode: FetchMode,

    /// Upper bound on observer registration, in milliseconds.
    pub registration_timeout_ms: Option<u64>,
}

impl ObserverConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the label recorded on subscription spans.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set where fetches run.
    pub fn with_fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    /// Bound observer registration. Saturates at `u64::MAX` milliseconds.
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The registration bound as a [`Duration`], if one is set.
    pub fn registration_timeout(&self) -> Option<Duration> {
        self.registration_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ObserverConfig::from_json("{}").unwrap();
        assert_eq!(config, ObserverConfig::default());
        assert_eq!(config.fetch_mode, FetchMode::Blocking);
        assert!(config.registration_timeout().is_none());
    }

    #[test]
    fn parses_all_fields() {
        let config = ObserverConfig::from_json(
            r#"{"label": "inbox", "fetch_mode": "inline", "registration_timeout_ms": 250}"#,
        )
        .unwrap();

        assert_eq!(config.label.as_deref(), Some("inbox"));
        assert_eq!(config.fetch_mode, FetchMode::Inline);
        assert_eq!(config.registration_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = ObserverConfig::from_json(r#"{"buffer": 4}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn oversized_timeout_saturates() {
        let config = ObserverConfig::default().with_registration_timeout(Duration::MAX);
        assert_eq!(config.registration_timeout_ms, Some(u64::MAX));
        assert_eq!(config.registration_timeout(), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn builder_matches_parsed() {
        let built = ObserverConfig::default()
            .with_label("inbox")
            .with_fetch_mode(FetchMode::Inline)
            .with_registration_timeout(Duration::from_millis(250));
        let parsed = ObserverConfig::from_json(
            r#"{"label": "inbox", "fetch_mode": "inline", "registration_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(built, parsed);
    }
}
