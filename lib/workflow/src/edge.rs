//! Workflow edges.

use flowrun_core::{EdgeId, NodeId};
use serde::{Deserialize, Serialize};

/// A directed dependency between two nodes.
///
/// An edge carrying a `condition` is only taken when the condition
/// template, rendered after the source completes, is truthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Identifier, unique within the workflow.
    pub id: EdgeId,
    /// The upstream node.
    pub source: NodeId,
    /// The downstream node.
    pub target: NodeId,
    /// Optional template deciding whether the edge is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new(id: impl Into<EdgeId>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Sets the edge condition.
    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Decides whether a rendered condition counts as taken.
///
/// `null`, `false`, `0`, empty strings, `"false"`, and empty collections are
/// falsy; everything else is truthy.
#[must_use]
pub fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0"
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ignores_editor_fields() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1", "source": "a", "target": "b", "type": "default"
        }))
        .expect("parse");
        assert_eq!(edge, Edge::new("e1", "a", "b"));
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!("False"), json!([])] {
            assert!(!is_truthy(&falsy), "{falsy} should be falsy");
        }
        for truthy in [json!(true), json!(1), json!("yes"), json!({"a": 1}), json!([0])] {
            assert!(is_truthy(&truthy), "{truthy} should be truthy");
        }
    }
}
