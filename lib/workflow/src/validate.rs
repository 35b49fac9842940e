//! Workflow validation and execution planning.
//!
//! Validation runs before any node executes and reports every problem it
//! finds. A workflow that passes is turned into an [`ExecutionPlan`]: a
//! topological order plus the edge lookups the run coordinator needs.

use crate::definition::WorkflowDefinition;
use crate::edge::Edge;
use crate::error::ValidationError;
use crate::graph::WorkflowGraph;
use crate::handler::HandlerRegistry;
use crate::interpolate::{self, INPUT_VAR, LAST_OUTPUT_VAR};
use flowrun_core::NodeId;
use std::collections::{HashMap, HashSet};

/// A validated workflow, ready to be scheduled.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    start: NodeId,
    order: Vec<NodeId>,
    position: HashMap<NodeId, usize>,
    incoming: HashMap<NodeId, Vec<Edge>>,
    outgoing: HashMap<NodeId, Vec<Edge>>,
    ends: Vec<NodeId>,
}

impl ExecutionPlan {
    /// The single start node.
    #[must_use]
    pub fn start(&self) -> &NodeId {
        &self.start
    }

    /// All nodes in topological order.
    #[must_use]
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Position of a node in the topological order.
    #[must_use]
    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.position.get(node).copied()
    }

    /// Edges leading into a node, in declaration order.
    #[must_use]
    pub fn incoming(&self, node: &NodeId) -> &[Edge] {
        self.incoming.get(node).map_or(&[], Vec::as_slice)
    }

    /// Edges leaving a node, in declaration order.
    #[must_use]
    pub fn outgoing(&self, node: &NodeId) -> &[Edge] {
        self.outgoing.get(node).map_or(&[], Vec::as_slice)
    }

    /// The end nodes, in topological order.
    #[must_use]
    pub fn ends(&self) -> &[NodeId] {
        &self.ends
    }

    /// Every edge as a `(source, target)` pair.
    pub fn dependencies(&self) -> impl Iterator<Item = (&NodeId, &NodeId)> {
        self.order
            .iter()
            .flat_map(|node| self.outgoing(node).iter().map(|e| (&e.source, &e.target)))
    }

    /// Sorts nodes by their position in the plan.
    pub fn sort(&self, nodes: &mut [NodeId]) {
        nodes.sort_by_key(|n| self.position(n).unwrap_or(usize::MAX));
    }
}

/// Validates a workflow without planning it.
///
/// # Errors
///
/// Returns every problem found.
pub fn validate(
    definition: &WorkflowDefinition,
    registry: &HandlerRegistry,
) -> Result<(), Vec<ValidationError>> {
    plan(definition, registry).map(|_| ())
}

/// Validates a workflow and computes its execution plan.
///
/// # Errors
///
/// Returns every problem found.
pub fn plan(
    definition: &WorkflowDefinition,
    registry: &HandlerRegistry,
) -> Result<ExecutionPlan, Vec<ValidationError>> {
    let (graph, mut errors) = WorkflowGraph::build(definition);

    check_node_ids(&graph, &mut errors);

    let starts: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.is_start())
        .map(|n| n.id.clone())
        .collect();
    match starts.as_slice() {
        [] => errors.push(ValidationError::MissingStartNode),
        [start] => {
            if !graph.predecessors(start).is_empty() {
                errors.push(ValidationError::StartHasIncomingEdges {
                    node: start.clone(),
                });
            }
        }
        _ => errors.push(ValidationError::MultipleStartNodes {
            nodes: starts.clone(),
        }),
    }
    if !graph.nodes().any(|n| n.is_end()) {
        errors.push(ValidationError::MissingEndNode);
    }

    let reachable = match starts.as_slice() {
        [start] => Some(graph.reachable_from(start)),
        _ => None,
    };
    for node in graph.nodes() {
        if node.is_start() {
            continue;
        }
        if graph.predecessors(&node.id).is_empty() {
            errors.push(ValidationError::NoIncomingEdges {
                node: node.id.clone(),
            });
        } else if reachable.as_ref().is_some_and(|r| !r.contains(&node.id)) {
            errors.push(ValidationError::Unreachable {
                node: node.id.clone(),
            });
        }
    }

    for nodes in graph.cycles() {
        errors.push(ValidationError::Cycle { nodes });
    }

    let output_keys = check_handlers(&graph, registry, &mut errors);
    check_references(definition, &graph, &output_keys, &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }

    let order = graph.topological_order();
    let position = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();
    let mut incoming: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    let mut outgoing: HashMap<NodeId, Vec<Edge>> = HashMap::new();
    for edge in &definition.edges {
        incoming
            .entry(edge.target.clone())
            .or_default()
            .push(edge.clone());
        outgoing
            .entry(edge.source.clone())
            .or_default()
            .push(edge.clone());
    }
    let ends = order
        .iter()
        .filter(|id| graph.node(id).is_some_and(|n| n.is_end()))
        .cloned()
        .collect();

    Ok(ExecutionPlan {
        start: starts.into_iter().next().ok_or_else(|| vec![ValidationError::MissingStartNode])?,
        order,
        position,
        incoming,
        outgoing,
        ends,
    })
}

/// Node ids double as variable names, so they must be plain path segments
/// and must not shadow the built-in variables.
fn check_node_ids(graph: &WorkflowGraph<'_>, errors: &mut Vec<ValidationError>) {
    for node in graph.nodes() {
        let id = node.id.as_str();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id == INPUT_VAR || id == LAST_OUTPUT_VAR {
            Some("is a reserved variable name")
        } else if id.contains('.') || interpolate::check_path(id).is_err() {
            Some("may only contain letters, digits, '-' and '_'")
        } else {
            None
        };
        if let Some(reason) = reason {
            errors.push(ValidationError::InvalidNodeId {
                node: node.id.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

/// Checks node types and configurations against the registry and returns
/// the declared output keys.
fn check_handlers(
    graph: &WorkflowGraph<'_>,
    registry: &HandlerRegistry,
    errors: &mut Vec<ValidationError>,
) -> HashSet<String> {
    let mut output_keys = HashSet::new();
    for node in graph.nodes() {
        let Some(handler) = registry.get(&node.kind) else {
            errors.push(ValidationError::UnknownNodeType {
                node: node.id.clone(),
                kind: node.kind.to_string(),
            });
            continue;
        };
        if let Err(reason) = handler.validate_config(&node.data) {
            errors.push(ValidationError::InvalidNodeConfig {
                node: node.id.clone(),
                reason,
            });
        }
        if let Some(key) = handler.output_key(&node.data) {
            let clashes = key == INPUT_VAR
                || key == LAST_OUTPUT_VAR
                || key.contains('.')
                || interpolate::check_path(&key).is_err()
                || graph.node(&NodeId::from(key.as_str())).is_some()
                || output_keys.contains(&key);
            if clashes {
                errors.push(ValidationError::InvalidOutputKey {
                    node: node.id.clone(),
                    key,
                });
            } else {
                output_keys.insert(key);
            }
        }
    }
    output_keys
}

fn check_references(
    definition: &WorkflowDefinition,
    graph: &WorkflowGraph<'_>,
    output_keys: &HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let known = |path: &str| {
        let root = interpolate::root_of(path);
        interpolate::check_path(path).is_ok()
            && (root == INPUT_VAR
                || root == LAST_OUTPUT_VAR
                || output_keys.contains(root)
                || graph.node(&NodeId::from(root)).is_some())
    };

    for node in graph.nodes() {
        for path in interpolate::value_references(&node.data) {
            if !known(&path) {
                errors.push(ValidationError::UnknownReference {
                    location: format!("node {}", node.id),
                    path,
                });
            }
        }
    }
    for edge in &definition.edges {
        let Some(condition) = &edge.condition else {
            continue;
        };
        for path in interpolate::references(condition) {
            if !known(&path) {
                errors.push(ValidationError::UnknownReference {
                    location: format!("edge {}", edge.id),
                    path,
                });
            }
        }
    }
}
