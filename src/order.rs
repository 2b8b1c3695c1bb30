//! Dependency-aware command ordering for a stage.
//!
//! Produces the linear order used for validity propagation, export and
//! execution - distinct from the stage's `command_ids` (user/insertion
//! order), which is preserved for rendering. The sort is a Kahn walk
//! seeded by insertion order: among ready commands the lowest (category,
//! insertion position) goes first, so category precedence reorders
//! commands exactly where no real dependency edge contradicts it.
//!
//! Synthetic constraints, recomputed on every sort and never stored as
//! graph edges:
//! - a starter command precedes everything else in its stage;
//! - a deleter follows every earlier command using a name it releases;
//! - a re-creation of a released name follows the deleter.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::catalog::{Catalog, DefinitionKind};
use crate::graph::{EntityGraph, NodeId};
use crate::node::NodeKind;
use crate::stage::Stage;
use crate::value::keyword_refs;

/// Compute the sorted command order of `stage`.
///
/// The result is always a valid topological order of the real edge set
/// restricted to the stage: for every edge `parent -> child` the parent
/// sorts earlier. Comments never appear (they carry no dependencies and
/// are rendered from insertion order only).
pub fn sort_stage(graph: &EntityGraph, catalog: &Catalog, stage: &Stage) -> Vec<NodeId> {
    let items: Vec<NodeId> = stage
        .command_ids
        .iter()
        .copied()
        .filter(|&id| {
            graph
                .get(id)
                .map(|n| !matches!(n.kind(), NodeKind::Comment { .. }))
                .unwrap_or(false)
        })
        .collect();
    let position: HashMap<NodeId, usize> =
        items.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut real: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
    for &id in &items {
        if let Some(node) = graph.get(id) {
            for &child in node.children() {
                if position.contains_key(&child) {
                    real.insert((id, child));
                }
            }
        }
    }

    let mut synthetic: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
    for &id in &items {
        match kind_of(graph, catalog, id) {
            DefinitionKind::Starter => {
                for &other in &items {
                    if other != id && kind_of(graph, catalog, other) != DefinitionKind::Starter {
                        synthetic.insert((id, other));
                    }
                }
            }
            DefinitionKind::Deleter => {
                deleter_constraints(graph, id, &items, &position, &mut synthetic);
            }
            _ => {}
        }
    }
    synthetic.retain(|edge| !real.contains(edge));

    kahn(graph, catalog, &items, &position, &real, &synthetic)
}

fn kind_of(graph: &EntityGraph, catalog: &Catalog, id: NodeId) -> DefinitionKind {
    graph
        .get(id)
        .and_then(|n| n.title())
        .map(|t| catalog.kind_of(t))
        .unwrap_or(DefinitionKind::Operator)
}

/// Category ordinal used for ready-queue priority. Variables sort like
/// the earliest category; hidden commands inherit their macro's.
fn category_of(graph: &EntityGraph, catalog: &Catalog, id: NodeId) -> u16 {
    let Some(node) = graph.get(id) else {
        return u16::MAX;
    };
    match node.kind() {
        NodeKind::Command { title, .. } => catalog.category_of(title),
        NodeKind::Variable { .. } => 0,
        NodeKind::Hidden { producer, .. } => graph
            .get(*producer)
            .and_then(|p| p.title())
            .map(|t| catalog.category_of(t))
            .unwrap_or(u16::MAX),
        NodeKind::Comment { .. } => u16::MAX,
    }
}

/// A deleter releases the names of everything it references. It must run
/// after every earlier user of those names, and a later command that
/// re-creates a released name must run after the deleter.
fn deleter_constraints(
    graph: &EntityGraph,
    deleter: NodeId,
    items: &[NodeId],
    position: &HashMap<NodeId, usize>,
    synthetic: &mut BTreeSet<(NodeId, NodeId)>,
) {
    let Some(node) = graph.get(deleter) else {
        return;
    };
    let Some(keywords) = node.keywords() else {
        return;
    };
    let deleter_pos = position[&deleter];

    let mut released: HashSet<String> = HashSet::new();
    for (_, value) in keywords {
        let mut names = Vec::new();
        value.names(&mut names);
        released.extend(names);
    }

    for target in keyword_refs(keywords) {
        let Some(target_node) = graph.get(target) else {
            continue;
        };
        released.insert(target_node.name().to_string());
        // Earlier users of the released result run before the deleter
        for &user in target_node.children() {
            if user == deleter {
                continue;
            }
            if let Some(&user_pos) = position.get(&user) {
                if user_pos < deleter_pos {
                    synthetic.insert((user, deleter));
                }
            }
        }
    }

    for &other in items {
        let Some(&other_pos) = position.get(&other) else {
            continue;
        };
        if other_pos <= deleter_pos {
            continue;
        }
        if let Some(other_node) = graph.get(other) {
            if released.contains(other_node.name()) {
                synthetic.insert((deleter, other));
            }
        }
    }
}

/// Kahn's algorithm with a (category, insertion position) ready queue.
///
/// Real and synthetic in-degrees are tracked separately: should the
/// synthetic constraints ever contradict each other (degenerate input),
/// the walk releases the lowest-priority command whose *real* parents
/// are all emitted, so the topological contract on real edges holds
/// unconditionally.
fn kahn(
    graph: &EntityGraph,
    catalog: &Catalog,
    items: &[NodeId],
    position: &HashMap<NodeId, usize>,
    real: &BTreeSet<(NodeId, NodeId)>,
    synthetic: &BTreeSet<(NodeId, NodeId)>,
) -> Vec<NodeId> {
    let mut real_degree: HashMap<NodeId, usize> = items.iter().map(|&i| (i, 0)).collect();
    let mut syn_degree: HashMap<NodeId, usize> = items.iter().map(|&i| (i, 0)).collect();
    let mut real_out: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut syn_out: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &(from, to) in real {
        *real_degree.get_mut(&to).unwrap() += 1;
        real_out.entry(from).or_default().push(to);
    }
    for &(from, to) in synthetic {
        *syn_degree.get_mut(&to).unwrap() += 1;
        syn_out.entry(from).or_default().push(to);
    }

    let priority = |id: NodeId| (category_of(graph, catalog, id), position[&id], id.0);
    let mut ready: BinaryHeap<Reverse<(u16, usize, u64)>> = items
        .iter()
        .filter(|&&id| real_degree[&id] == 0 && syn_degree[&id] == 0)
        .map(|&id| Reverse(priority(id)))
        .collect();

    let by_priority: HashMap<(u16, usize, u64), NodeId> =
        items.iter().map(|&id| (priority(id), id)).collect();

    let mut order: Vec<NodeId> = Vec::with_capacity(items.len());
    let mut emitted: HashSet<NodeId> = HashSet::new();

    while order.len() < items.len() {
        let next = match ready.pop() {
            Some(Reverse(key)) => by_priority[&key],
            None => {
                // Synthetic constraints contradicted each other; release
                // the best command whose real parents are all emitted.
                let forced = items
                    .iter()
                    .copied()
                    .filter(|id| !emitted.contains(id) && real_degree[id] == 0)
                    .min_by_key(|&id| priority(id))
                    .expect("real edges are acyclic");
                tracing::trace!(node = %forced, "forced release during stage sort");
                forced
            }
        };
        if !emitted.insert(next) {
            continue;
        }
        order.push(next);
        for &child in real_out.get(&next).into_iter().flatten() {
            let degree = real_degree.get_mut(&child).unwrap();
            *degree = degree.saturating_sub(1);
            if *degree == 0 && syn_degree[&child] == 0 && !emitted.contains(&child) {
                ready.push(Reverse(priority(child)));
            }
        }
        for &child in syn_out.get(&next).into_iter().flatten() {
            let degree = syn_degree.get_mut(&child).unwrap();
            *degree = degree.saturating_sub(1);
            if *degree == 0 && real_degree[&child] == 0 && !emitted.contains(&child) {
                ready.push(Reverse(priority(child)));
            }
        }
    }
    order
}
