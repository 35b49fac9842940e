//! Workflow nodes.
//!
//! A node is an id, a type tag and a free-form `data` object. The engine
//! never interprets `data` itself: the handler registered for the node's
//! type parses and validates it.

use flowrun_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The type tag of a node.
///
/// Unknown tags deserialize to [`NodeKind::Custom`] so that validation can
/// report them against the handler registry instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    /// Entry point. Emits the run input.
    Start,
    /// LLM agent with a bounded tool-call loop.
    Agent,
    /// Outbound HTTP request.
    Http,
    /// Direct call to an external tool. Tagged `arcade` (or `tool`).
    Tool,
    /// Terminal marker.
    End,
    /// A type contributed by a registered handler.
    Custom(String),
}

impl NodeKind {
    /// Returns the wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Agent => "agent",
            Self::Http => "http",
            Self::Tool => "arcade",
            Self::End => "end",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<String> for NodeKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "start" => Self::Start,
            "agent" => Self::Agent,
            "http" => Self::Http,
            "arcade" | "tool" => Self::Tool,
            "end" => Self::End,
            _ => Self::Custom(tag),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, unique within the workflow.
    pub id: NodeId,
    /// Type tag selecting the handler.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Type-specific configuration. May contain `{{ ... }}` placeholders.
    #[serde(default)]
    pub data: JsonValue,
}

impl Node {
    /// Creates a node with empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            data: JsonValue::Object(serde_json::Map::new()),
        }
    }

    /// Sets the node configuration.
    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    /// Returns true for the start node type.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.kind == NodeKind::Start
    }

    /// Returns true for the end node type.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.kind == NodeKind::End
    }

    /// Per-node override of the handler timeout, from `data.timeoutSecs`.
    #[must_use]
    pub fn timeout_secs(&self) -> Option<u64> {
        self.data.get("timeoutSecs").and_then(JsonValue::as_u64)
    }
}
