//! Entity graph - id-based node storage with mutual dependency edges.
//!
//! The graph owns every node of a history (across all cases and stages)
//! and is the single place edges live. It enforces exactly two things:
//! edges are always mutual, and the dependency relation stays acyclic.
//! Cascade policy on deletion belongs to the layers above.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::error::{CycleError, StructuralError};
use crate::node::Node;

/// Dense node identifier, unique within one graph and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Sentinel id of a node not yet inserted into a graph.
    pub const DETACHED: NodeId = NodeId(0);

    pub fn is_detached(&self) -> bool {
        *self == NodeId::DETACHED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node storage with parent/child (dependency) relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGraph {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl Default for EntityGraph {
    fn default() -> Self {
        EntityGraph::new()
    }
}

impl EntityGraph {
    pub fn new() -> Self {
        EntityGraph {
            nodes: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert a detached node, assigning it a fresh id. If `parent` is
    /// given the dependency edge is added as well (a fresh node cannot
    /// close a cycle).
    pub fn add(&mut self, mut node: Node, parent: Option<NodeId>) -> Result<NodeId, StructuralError> {
        if !node.id.is_detached() {
            return Err(StructuralError::AlreadyOwned { id: node.id });
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(&parent) {
                return Err(StructuralError::UnknownNode { id: parent });
            }
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        node.id = id;
        self.nodes.insert(id, node);
        if let Some(parent) = parent {
            // Both endpoints exist and the child is fresh; cannot fail.
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.insert(id);
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.parents.insert(parent);
            }
        }
        Ok(id)
    }

    /// O(1) lookup; `None` if absent, never an error.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Add the dependency edge `parent -> child`. Idempotent; adding an
    /// existing edge is a no-op. Fails without touching the graph when
    /// the edge would close a cycle.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) -> Result<(), CycleError> {
        if parent == child {
            return Err(CycleError::WouldCycle { parent, child });
        }
        if !self.nodes.contains_key(&parent) || !self.nodes.contains_key(&child) {
            // Edges to absent nodes stay absent; dependents surface the
            // miss as a validity flag, not a structural failure.
            return Ok(());
        }
        if self
            .nodes
            .get(&parent)
            .map(|n| n.children.contains(&child))
            .unwrap_or(false)
        {
            return Ok(());
        }
        if self.has_path(child, parent) {
            return Err(CycleError::WouldCycle { parent, child });
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.insert(parent);
        }
        Ok(())
    }

    /// Remove the edge `parent -> child`; no-op when absent.
    pub fn remove_edge(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.remove(&child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.remove(&parent);
        }
    }

    /// Delete the node and every incident edge. Does not cascade to
    /// children - that policy is owned by higher layers.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        for parent in &node.parents {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.remove(&id);
            }
        }
        for child in &node.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parents.remove(&id);
            }
        }
        Some(node)
    }

    /// Reachability over child edges: does `to` (transitively) depend on
    /// `from`? Also the cycle-prevention primitive.
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut queue = VecDeque::from([from]);
        let mut seen = std::collections::HashSet::from([from]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for &child in &node.children {
                if child == to {
                    return true;
                }
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(names: &[&str]) -> (EntityGraph, Vec<NodeId>) {
        let mut graph = EntityGraph::new();
        let ids = names
            .iter()
            .map(|n| graph.add(Node::command(n, "OP", vec![]), None).unwrap())
            .collect();
        (graph, ids)
    }

    #[test]
    fn test_add_assigns_fresh_ids() {
        let (graph, ids) = graph_with(&["a", "b"]);
        assert_ne!(ids[0], ids[1]);
        assert!(!ids[0].is_detached());
        assert_eq!(graph.get(ids[0]).unwrap().name(), "a");
        assert!(graph.get(NodeId(999)).is_none());
    }

    #[test]
    fn test_double_insert_is_structural_error() {
        let (mut graph, ids) = graph_with(&["a"]);
        let owned = graph.get(ids[0]).unwrap().clone();
        assert!(matches!(
            graph.add(owned, None),
            Err(StructuralError::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn test_edges_are_mutual() {
        let (mut graph, ids) = graph_with(&["a", "b"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        assert!(graph.get(ids[0]).unwrap().children().contains(&ids[1]));
        assert!(graph.get(ids[1]).unwrap().parents().contains(&ids[0]));
    }

    #[test]
    fn test_edge_ops_are_idempotent() {
        let (mut graph, ids) = graph_with(&["a", "b"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        graph.add_edge(ids[0], ids[1]).unwrap();
        assert_eq!(graph.get(ids[0]).unwrap().children().len(), 1);
        graph.remove_edge(ids[0], ids[1]);
        graph.remove_edge(ids[0], ids[1]);
        assert!(graph.get(ids[0]).unwrap().children().is_empty());
        assert!(graph.get(ids[1]).unwrap().parents().is_empty());
    }

    #[test]
    fn test_cycle_is_rejected_and_graph_untouched() {
        let (mut graph, ids) = graph_with(&["a", "b", "c"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        graph.add_edge(ids[1], ids[2]).unwrap();
        assert!(matches!(
            graph.add_edge(ids[2], ids[0]),
            Err(CycleError::WouldCycle { .. })
        ));
        // No partial edge was left behind
        assert!(graph.get(ids[2]).unwrap().children().is_empty());
        assert!(matches!(
            graph.add_edge(ids[0], ids[0]),
            Err(CycleError::WouldCycle { .. })
        ));
    }

    #[test]
    fn test_acyclicity_invariant() {
        let (mut graph, ids) = graph_with(&["a", "b", "c", "d"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        graph.add_edge(ids[1], ids[3]).unwrap();
        graph.add_edge(ids[0], ids[2]).unwrap();
        graph.add_edge(ids[2], ids[3]).unwrap();
        for &a in &ids {
            for &b in &ids {
                if a != b {
                    assert!(
                        !(graph.has_path(a, b) && graph.has_path(b, a)),
                        "both {} and {} reach each other",
                        a,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn test_remove_drops_incident_edges() {
        let (mut graph, ids) = graph_with(&["a", "b", "c"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        graph.add_edge(ids[1], ids[2]).unwrap();
        graph.remove(ids[1]).unwrap();
        assert!(graph.get(ids[1]).is_none());
        assert!(graph.get(ids[0]).unwrap().children().is_empty());
        assert!(graph.get(ids[2]).unwrap().parents().is_empty());
        // Removing again is a clean miss
        assert!(graph.remove(ids[1]).is_none());
    }

    #[test]
    fn test_has_path_is_transitive_only_along_children() {
        let (mut graph, ids) = graph_with(&["a", "b", "c"]);
        graph.add_edge(ids[0], ids[1]).unwrap();
        graph.add_edge(ids[1], ids[2]).unwrap();
        assert!(graph.has_path(ids[0], ids[2]));
        assert!(!graph.has_path(ids[2], ids[0]));
    }
}
