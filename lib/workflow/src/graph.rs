//! Workflow graph view using petgraph.
//!
//! Borrows the nodes and edges of a [`WorkflowDefinition`] into a directed
//! graph for structural checks: reachability, cycles and ordering.

use crate::definition::WorkflowDefinition;
use crate::edge::Edge;
use crate::error::ValidationError;
use crate::node::Node;
use flowrun_core::{EdgeId, NodeId};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A borrowed graph over a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowGraph<'a> {
    graph: DiGraph<&'a Node, &'a Edge>,
    node_index_map: HashMap<&'a NodeId, NodeIndex>,
}

impl<'a> WorkflowGraph<'a> {
    /// Builds the graph, reporting duplicate ids and dangling edges.
    ///
    /// Duplicate nodes keep their first occurrence; dangling edges are left
    /// out of the graph.
    #[must_use]
    pub fn build(definition: &'a WorkflowDefinition) -> (Self, Vec<ValidationError>) {
        let mut errors = Vec::new();
        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();

        for node in &definition.nodes {
            if node_index_map.contains_key(&node.id) {
                errors.push(ValidationError::DuplicateNodeId {
                    node: node.id.clone(),
                });
                continue;
            }
            let index = graph.add_node(node);
            node_index_map.insert(&node.id, index);
        }

        let mut edge_ids: HashSet<&EdgeId> = HashSet::new();
        for edge in &definition.edges {
            if !edge_ids.insert(&edge.id) {
                errors.push(ValidationError::DuplicateEdgeId {
                    edge: edge.id.clone(),
                });
            }
            let source = node_index_map.get(&edge.source);
            let target = node_index_map.get(&edge.target);
            for (endpoint, index) in [(&edge.source, source), (&edge.target, target)] {
                if index.is_none() {
                    errors.push(ValidationError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            if let (Some(&source), Some(&target)) = (source, target) {
                graph.add_edge(source, target, edge);
            }
        }

        (
            Self {
                graph,
                node_index_map,
            },
            errors,
        )
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&'a Node> {
        let index = self.node_index_map.get(id)?;
        self.graph.node_weight(*index).copied()
    }

    /// Returns all nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &'a Node> + '_ {
        self.graph.node_weights().copied()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the outgoing edges of a node with their targets.
    #[must_use]
    pub fn successors(&self, id: &NodeId) -> Vec<(&'a Node, &'a Edge)> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Returns the incoming edges of a node with their sources.
    #[must_use]
    pub fn predecessors(&self, id: &NodeId) -> Vec<(&'a Node, &'a Edge)> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<(&'a Node, &'a Edge)> {
        let Some(&index) = self.node_index_map.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<_> = self
            .graph
            .edges_directed(index, direction)
            .filter_map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                Some((other, *self.graph.node_weight(other)?, *edge.weight()))
            })
            .collect();
        // petgraph walks adjacency lists newest first
        found.sort_by_key(|(other, _, _)| *other);
        found.into_iter().map(|(_, node, edge)| (node, edge)).collect()
    }

    /// Returns the ids of every node reachable from `start`, including it.
    #[must_use]
    pub fn reachable_from(&self, start: &NodeId) -> HashSet<&'a NodeId> {
        let mut reached = HashSet::new();
        let Some(&index) = self.node_index_map.get(start) else {
            return reached;
        };
        let mut bfs = Bfs::new(&self.graph, index);
        while let Some(next) = bfs.next(&self.graph) {
            if let Some(node) = self.graph.node_weight(next) {
                reached.insert(&node.id);
            }
        }
        reached
    }

    /// Returns every cycle, as the nodes of each strongly connected
    /// component in declaration order.
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<NodeId>> {
        petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&idx| self.graph.contains_edge(idx, idx))
            })
            .map(|mut component| {
                component.sort();
                component
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).map(|n| n.id.clone()))
                    .collect()
            })
            .collect()
    }

    /// Returns true if the graph contains a cycle.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Returns a topological ordering, breaking ties by declaration order.
    ///
    /// Nodes on a cycle are left out.
    #[must_use]
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.edges_directed(idx, Direction::Incoming).count()))
            .collect();
        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = ready.pop_first() {
            if let Some(node) = self.graph.node_weight(idx) {
                order.push(node.id.clone());
            }
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&edge.target()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(edge.target());
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "diamond")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("left", NodeKind::Http))
            .with_node(Node::new("right", NodeKind::Http))
            .with_node(Node::new("join", NodeKind::Agent))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge(Edge::new("e1", "start", "left"))
            .with_edge(Edge::new("e2", "start", "right"))
            .with_edge(Edge::new("e3", "left", "join"))
            .with_edge(Edge::new("e4", "right", "join"))
            .with_edge(Edge::new("e5", "join", "end"))
    }

    fn ids(order: &[NodeId]) -> Vec<&str> {
        order.iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn topological_order_follows_declaration_ties() {
        let definition = diamond();
        let (graph, errors) = WorkflowGraph::build(&definition);
        assert!(errors.is_empty());
        assert_eq!(
            ids(&graph.topological_order()),
            vec!["start", "left", "right", "join", "end"]
        );
    }

    #[test]
    fn neighbors_in_declaration_order() {
        let definition = diamond();
        let (graph, _) = WorkflowGraph::build(&definition);
        let preds: Vec<&str> = graph
            .predecessors(&NodeId::from("join"))
            .into_iter()
            .map(|(n, _)| n.id.as_str())
            .collect();
        assert_eq!(preds, vec!["left", "right"]);
        assert_eq!(graph.successors(&NodeId::from("start")).len(), 2);
    }

    #[test]
    fn reports_duplicates_and_dangling_edges() {
        let definition = diamond()
            .with_node(Node::new("left", NodeKind::Http))
            .with_edge(Edge::new("e1", "join", "ghost"));
        let (graph, errors) = WorkflowGraph::build(&definition);

        assert_eq!(graph.node_count(), 5);
        assert!(errors.contains(&ValidationError::DuplicateNodeId {
            node: NodeId::from("left")
        }));
        assert!(errors.contains(&ValidationError::DuplicateEdgeId {
            edge: EdgeId::from("e1")
        }));
        assert!(errors.contains(&ValidationError::DanglingEdge {
            edge: EdgeId::from("e1"),
            node: NodeId::from("ghost")
        }));
    }

    #[test]
    fn finds_cycles_and_reachability() {
        let definition = diamond()
            .with_node(Node::new("a", NodeKind::Http))
            .with_node(Node::new("b", NodeKind::Http))
            .with_edge(Edge::new("c1", "a", "b"))
            .with_edge(Edge::new("c2", "b", "a"));
        let (graph, _) = WorkflowGraph::build(&definition);

        assert!(graph.is_cyclic());
        assert_eq!(
            graph.cycles(),
            vec![vec![NodeId::from("a"), NodeId::from("b")]]
        );
        let reached = graph.reachable_from(&NodeId::from("start"));
        assert_eq!(reached.len(), 5);
        assert!(!reached.contains(&NodeId::from("a")));
        assert_eq!(graph.topological_order().len(), 5);
    }
}
