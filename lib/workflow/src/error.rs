//! Error types for the workflow crate.
//!
//! - `ValidationError`: a workflow or run input rejected before execution
//! - `TemplateError`: a `{{ ... }}` placeholder that cannot be resolved
//! - `NodeError`: a single node execution failed or needs outside help
//!
//! Store, approval and engine errors live next to their traits.

use flowrun_ai::ChatMessage;
use flowrun_core::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Problems found while validating a workflow or a run input.
///
/// Validation collects every problem it can find rather than stopping at
/// the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No node of type `start`.
    MissingStartNode,
    /// More than one node of type `start`.
    MultipleStartNodes { nodes: Vec<NodeId> },
    /// The start node is the target of an edge.
    StartHasIncomingEdges { node: NodeId },
    /// No node of type `end`.
    MissingEndNode,
    /// Two nodes share an id.
    DuplicateNodeId { node: NodeId },
    /// A node id cannot be used as a variable namespace.
    InvalidNodeId { node: NodeId, reason: String },
    /// Two edges share an id.
    DuplicateEdgeId { edge: EdgeId },
    /// An edge points at a node that does not exist.
    DanglingEdge { edge: EdgeId, node: NodeId },
    /// A non-start node that nothing leads to.
    NoIncomingEdges { node: NodeId },
    /// A node that cannot be reached from the start node.
    Unreachable { node: NodeId },
    /// The graph contains a cycle through these nodes.
    Cycle { nodes: Vec<NodeId> },
    /// No handler is registered for the node's type.
    UnknownNodeType { node: NodeId, kind: String },
    /// The node's handler rejected its configuration.
    InvalidNodeConfig { node: NodeId, reason: String },
    /// A placeholder refers to something that can never exist at run time.
    UnknownReference { location: String, path: String },
    /// An output key collides with a node id or another output key.
    InvalidOutputKey { node: NodeId, key: String },
    /// A required input variable was not supplied.
    MissingInput { name: String },
    /// An input variable has the wrong type.
    InvalidInput {
        name: String,
        expected: String,
        found: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStartNode => write!(f, "workflow has no start node"),
            Self::MultipleStartNodes { nodes } => {
                let ids: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "workflow has multiple start nodes: {}", ids.join(", "))
            }
            Self::StartHasIncomingEdges { node } => {
                write!(f, "start node {node} has incoming edges")
            }
            Self::MissingEndNode => write!(f, "workflow has no end node"),
            Self::DuplicateNodeId { node } => write!(f, "duplicate node id: {node}"),
            Self::InvalidNodeId { node, reason } => write!(f, "invalid node id '{node}': {reason}"),
            Self::DuplicateEdgeId { edge } => write!(f, "duplicate edge id: {edge}"),
            Self::DanglingEdge { edge, node } => {
                write!(f, "edge {edge} references unknown node {node}")
            }
            Self::NoIncomingEdges { node } => write!(f, "node {node} has no incoming edges"),
            Self::Unreachable { node } => {
                write!(f, "node {node} is not reachable from the start node")
            }
            Self::Cycle { nodes } => {
                let ids: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "cycle detected through: {}", ids.join(" -> "))
            }
            Self::UnknownNodeType { node, kind } => {
                write!(f, "node {node} has unknown type '{kind}'")
            }
            Self::InvalidNodeConfig { node, reason } => {
                write!(f, "node {node} has invalid configuration: {reason}")
            }
            Self::UnknownReference { location, path } => {
                write!(f, "{location} references unknown variable '{path}'")
            }
            Self::InvalidOutputKey { node, key } => {
                write!(f, "node {node} output key '{key}' collides with another variable")
            }
            Self::MissingInput { name } => write!(f, "missing required input '{name}'"),
            Self::InvalidInput {
                name,
                expected,
                found,
            } => write!(f, "input '{name}' must be {expected}, got {found}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// A placeholder that cannot be resolved.
///
/// Unresolvable placeholders are never replaced with an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateError {
    /// The path does not lead to a value.
    UnresolvedPath { path: String },
    /// The path is not a dotted identifier path.
    MalformedPath { path: String },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedPath { path } => {
                write!(f, "template resolution failed: '{path}' does not resolve")
            }
            Self::MalformedPath { path } => {
                write!(f, "template resolution failed: malformed path '{path}'")
            }
        }
    }
}

impl std::error::Error for TemplateError {}

/// Failures of a single node execution.
///
/// Persisted in run checkpoints, so it is serializable. Variants that can
/// continue later carry an opaque `continuation` handed back to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    /// The node's configuration is unusable.
    InvalidConfig { reason: String },
    /// A placeholder in the node's configuration did not resolve.
    Template { error: TemplateError },
    /// A failure worth retrying with backoff.
    Transient {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation: Option<JsonValue>,
    },
    /// The handler did not finish in time.
    Timeout { after_ms: u64 },
    /// An HTTP call answered with a non-success status.
    HttpStatus { status: u16, body: JsonValue },
    /// A tool needs the user to authorize it out of band.
    AuthRequired {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authorization_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation: Option<JsonValue>,
    },
    /// A human rejected the proposed action.
    UserRejected { reason: String },
    /// An agent produced no final answer within its iteration budget.
    IterationLimitExceeded {
        max: u32,
        transcript: Vec<ChatMessage>,
    },
    /// An agent asked for a tool it does not declare.
    UnknownTool {
        name: String,
        transcript: Vec<ChatMessage>,
    },
    /// A tool call failed permanently.
    ToolFailed {
        tool: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        transcript: Vec<ChatMessage>,
    },
    /// The LLM provider failed permanently.
    ProviderFailed {
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        transcript: Vec<ChatMessage>,
    },
    /// Anything else.
    Fatal { reason: String },
}

impl NodeError {
    /// Creates a transient error without retry hints.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after_secs: None,
            continuation: None,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns true if the engine should retry automatically.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Returns true if a later resume may re-run the node.
    #[must_use]
    pub fn retryable_on_resume(&self) -> bool {
        self.is_transient() || matches!(self, Self::AuthRequired { .. })
    }

    /// Provider-supplied delay before the next attempt.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Transient {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// State the handler wants back on its next attempt.
    #[must_use]
    pub fn continuation(&self) -> Option<&JsonValue> {
        match self {
            Self::Transient { continuation, .. } | Self::AuthRequired { continuation, .. } => {
                continuation.as_ref()
            }
            _ => None,
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid node configuration: {reason}"),
            Self::Template { error } => write!(f, "{error}"),
            Self::Transient { reason, .. } => write!(f, "transient failure: {reason}"),
            Self::Timeout { after_ms } => write!(f, "node timed out after {after_ms}ms"),
            Self::HttpStatus { status, .. } => write!(f, "HTTP request returned status {status}"),
            Self::AuthRequired {
                tool,
                authorization_url,
                ..
            } => match authorization_url {
                Some(url) => write!(f, "tool '{tool}' requires authorization at {url}"),
                None => write!(f, "tool '{tool}' requires authorization"),
            },
            Self::UserRejected { reason } => write!(f, "rejected by user: {reason}"),
            Self::IterationLimitExceeded { max, .. } => {
                write!(f, "agent produced no answer after {max} iterations")
            }
            Self::UnknownTool { name, .. } => write!(f, "agent requested undeclared tool '{name}'"),
            Self::ToolFailed { tool, reason, .. } => write!(f, "tool '{tool}' failed: {reason}"),
            Self::ProviderFailed { reason, .. } => write!(f, "LLM provider failed: {reason}"),
            Self::Fatal { reason } => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<TemplateError> for NodeError {
    fn from(error: TemplateError) -> Self {
        Self::Template { error }
    }
}
