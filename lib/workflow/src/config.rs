//! Engine configuration.
//!
//! Deserializable so that binaries can nest it in their own configuration
//! and load it with the `config` crate.

use crate::retry::RetryConfig;
use flowrun_ai::DEFAULT_MAX_ITERATIONS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every run an engine executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt handler timeout, in seconds. Nodes may override it with
    /// `timeoutSecs` in their data.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Iteration budget for agent nodes that do not set `maxIterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Whether HTTP nodes fail on non-2xx responses unless they say otherwise.
    #[serde(default = "default_http_fail_on_non_2xx")]
    pub http_fail_on_non_2xx: bool,

    /// End user that tools act for when a node names none.
    #[serde(default)]
    pub default_user_id: Option<String>,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_node_timeout_secs() -> u64 {
    30
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_http_fail_on_non_2xx() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout_secs(),
            default_max_iterations: default_max_iterations(),
            http_fail_on_non_2xx: default_http_fail_on_non_2xx(),
            default_user_id: None,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Returns the default per-attempt handler timeout.
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default handler timeout.
    #[must_use]
    pub fn with_node_timeout_secs(mut self, secs: u64) -> Self {
        self.node_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_has_correct_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.node_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_max_iterations, 10);
        assert!(config.http_fail_on_non_2xx);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"node_timeout_secs": 5, "retry": {"max_retries": 1}}"#)
                .expect("parse");
        assert_eq!(config.node_timeout_secs, 5);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert_eq!(config.default_max_iterations, 10);
    }
}
