//! Node handler trait and registry.
//!
//! Every node type is executed by a [`NodeHandler`]. Handlers receive the
//! node's configuration with placeholders already resolved and return either
//! an output or a request for human approval. New node types are added by
//! registering another handler; the engine itself never matches on types.

use crate::approval::{ApprovalDecision, ProposedAction};
use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::interpolate::{LAST_OUTPUT_VAR, Variables};
use crate::node::{Node, NodeKind};
use async_trait::async_trait;
use flowrun_core::WorkflowRunId;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Decision and saved state handed back to a node that was paused.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeState {
    /// The human decision, for nodes that waited on approval.
    pub approval: Option<ApprovalDecision>,
    /// State the handler returned when it paused or failed.
    pub continuation: Option<JsonValue>,
}

/// Everything a handler sees for one execution.
#[derive(Debug)]
pub struct NodeContext<'a> {
    /// The run being executed.
    pub run_id: WorkflowRunId,
    /// The node being executed.
    pub node: &'a Node,
    /// The node's configuration with placeholders resolved.
    pub config: JsonValue,
    /// Read-only view of the run variables.
    pub variables: &'a Variables,
    /// Present when the node is being resumed or retried.
    pub resume: Option<ResumeState>,
    /// Engine-wide settings.
    pub settings: &'a EngineConfig,
    /// Time limit for one handler call.
    pub timeout: Duration,
}

impl NodeContext<'_> {
    /// Returns the approval decision, if one exists.
    #[must_use]
    pub fn approval(&self) -> Option<ApprovalDecision> {
        self.resume.as_ref().and_then(|r| r.approval)
    }

    /// Returns the continuation handed back from an earlier attempt.
    #[must_use]
    pub fn continuation(&self) -> Option<&JsonValue> {
        self.resume.as_ref().and_then(|r| r.continuation.as_ref())
    }

    /// Output of the upstream node(s), as seen by this node.
    #[must_use]
    pub fn last_output(&self) -> &JsonValue {
        self.variables
            .get(LAST_OUTPUT_VAR)
            .unwrap_or(&JsonValue::Null)
    }

    /// Parses the resolved configuration into a typed struct.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] if the configuration does not fit.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        parse_config(&self.config).map_err(|reason| NodeError::InvalidConfig { reason })
    }
}

/// Parses a node configuration, treating `null` as an empty object.
///
/// # Errors
///
/// Returns the deserialization message on mismatch.
pub fn parse_config<T: DeserializeOwned>(config: &JsonValue) -> Result<T, String> {
    let value = if config.is_null() {
        JsonValue::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// What a node produced.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// The value stored under the node id.
    pub value: JsonValue,
    /// Whether the node changed anything outside the engine.
    pub side_effects_performed: bool,
    /// Diagnostics kept with the node result but not exposed as a variable.
    pub metadata: Option<JsonValue>,
}

impl NodeOutput {
    /// Creates an output without side effects.
    #[must_use]
    pub fn pure(value: JsonValue) -> Self {
        Self {
            value,
            side_effects_performed: false,
            metadata: None,
        }
    }

    /// Creates an output from a node that acted on the outside world.
    #[must_use]
    pub fn with_side_effects(value: JsonValue) -> Self {
        Self {
            value,
            side_effects_performed: true,
            metadata: None,
        }
    }

    /// Attaches diagnostics.
    #[must_use]
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a successful handler call.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node finished.
    Completed(NodeOutput),
    /// The node wants a human decision before acting.
    ApprovalRequired {
        /// What the node intends to do.
        action: ProposedAction,
        /// State to hand back once the decision exists.
        continuation: Option<JsonValue>,
    },
}

/// Executes one node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler serves.
    fn kind(&self) -> NodeKind;

    /// Checks a node's raw configuration before any run starts.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the configuration is unusable.
    fn validate_config(&self, _config: &JsonValue) -> Result<(), String> {
        Ok(())
    }

    /// Extra variable name the node's output is published under.
    fn output_key(&self, _config: &JsonValue) -> Option<String> {
        None
    }

    /// Whether the handler applies [`NodeContext::timeout`] to each external
    /// call itself. The engine then does not bound the whole call, and a
    /// slow call fails with whatever continuation the handler attaches.
    fn bounds_own_calls(&self) -> bool {
        false
    }

    /// Executes the node.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeError`] when the node fails or needs authorization.
    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError>;
}

/// Node handlers keyed by node type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.insert(handler.kind(), handler)
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn NodeHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Looks up the handler for a node type.
    #[must_use]
    pub fn get(&self, kind: &NodeKind) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.get(kind)
    }

    /// Returns true if a handler serves this node type.
    #[must_use]
    pub fn contains(&self, kind: &NodeKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Returns the registered node types, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
