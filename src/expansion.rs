//! Macro hidden-output expansion.
//!
//! A macro command can declare additional named outputs inline in its
//! keyword values (`CO('name')` markers). Each marker owns one hidden
//! command inserted right after the macro in the stage sequence, with a
//! macro -> hidden dependency edge. Re-running the expansion after a
//! keyword edit reconciles by set:
//! - markers that kept their name keep their hidden command untouched;
//! - leftover old and new names are paired in declaration order and the
//!   hidden command is *renamed in place* - identity and every edge to
//!   its own children survive;
//! - brand-new markers append hidden commands at the end of the macro's
//!   hidden block;
//! - vanished markers delete their hidden command, cascading to its
//!   dependents as dependency errors, never silently re-parenting them.
//!
//! Among several untyped outputs produced by the same keyword occurrence
//! no ordering is promised; only the order between distinct markers
//! (declaration order) is stable.

use tracing::debug;

use crate::catalog::TypeTag;
use crate::graph::NodeId;
use crate::history::History;
use crate::node::{Node, NodeKind};
use crate::value::keyword_markers;

/// Bring the macro's hidden commands in line with its current markers.
/// Returns the hidden command ids in marker order.
pub(crate) fn reconcile(history: &mut History, macro_id: NodeId) -> Vec<NodeId> {
    let Some(node) = history.graph().get(macro_id) else {
        return Vec::new();
    };
    let Some(keywords) = node.keywords() else {
        return Vec::new();
    };
    let markers = keyword_markers(keywords);
    let definition = node
        .title()
        .and_then(|t| history.catalog().definition(t))
        .cloned();
    let marker_types: Vec<Option<TypeTag>> = markers
        .iter()
        .map(|(keyword, _)| definition.as_ref().and_then(|d| d.output_type(keyword)))
        .collect();

    let Some(stage_id) = history.stage_of(macro_id) else {
        return Vec::new();
    };
    let existing: Vec<NodeId> = history
        .stage(stage_id)
        .map(|stage| {
            stage
                .command_ids()
                .iter()
                .copied()
                .filter(|&id| {
                    history
                        .graph()
                        .get(id)
                        .and_then(|n| n.producer())
                        .map(|p| p == macro_id)
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();

    // Pass 1: markers that kept their name claim their hidden command.
    let mut unclaimed: Vec<NodeId> = existing.clone();
    let mut assigned: Vec<Option<NodeId>> = vec![None; markers.len()];
    for (i, (_, name)) in markers.iter().enumerate() {
        if let Some(pos) = unclaimed.iter().position(|&id| {
            history
                .graph()
                .get(id)
                .map(|n| n.name() == name)
                .unwrap_or(false)
        }) {
            assigned[i] = Some(unclaimed.remove(pos));
        }
    }

    // Pass 2: leftover markers and leftover hidden commands pair up in
    // declaration order - a rename, never a delete+recreate.
    for slot in assigned.iter_mut() {
        if slot.is_none() && !unclaimed.is_empty() {
            *slot = Some(unclaimed.remove(0));
        }
    }

    // Pass 3: vanished markers lose their hidden command.
    for dead in unclaimed {
        debug!(macro_id = %macro_id, hidden = %dead, "hidden output marker removed");
        history.delete_node_cascade(dead);
    }

    // Pass 4: apply names/types, creating what is still missing at the
    // end of the macro's hidden block.
    let mut result = Vec::with_capacity(markers.len());
    for (i, (_, name)) in markers.iter().enumerate() {
        let type_tag = marker_types[i].clone();
        match assigned[i] {
            Some(id) => {
                let node = history
                    .graph_mut()
                    .get_mut(id)
                    .expect("surviving hidden command exists");
                if node.name != *name {
                    debug!(hidden = %id, from = %node.name, to = %name, "hidden output renamed in place");
                    node.name = name.clone();
                }
                if let NodeKind::Hidden {
                    type_tag: slot, ..
                } = &mut node.kind
                {
                    *slot = type_tag;
                }
                result.push(id);
            }
            None => {
                let position = hidden_block_end(history, stage_id, macro_id);
                let hidden = Node::new(
                    name,
                    NodeKind::Hidden {
                        producer: macro_id,
                        type_tag,
                    },
                );
                let id = history
                    .insert_node(stage_id, hidden, Some(position), Some(macro_id))
                    .expect("macro exists as parent");
                debug!(macro_id = %macro_id, hidden = %id, name = %name, "hidden output created");
                result.push(id);
            }
        }
    }
    result
}

/// First stage position after the macro and its current hidden commands.
fn hidden_block_end(history: &History, stage_id: crate::stage::StageId, macro_id: NodeId) -> usize {
    let Some(stage) = history.stage(stage_id) else {
        return 0;
    };
    let Some(start) = stage.position(macro_id) else {
        return stage.command_ids().len();
    };
    let mut end = start + 1;
    while let Some(&id) = stage.command_ids().get(end) {
        let owned = history
            .graph()
            .get(id)
            .and_then(|n| n.producer())
            .map(|p| p == macro_id)
            .unwrap_or(false);
        if !owned {
            break;
        }
        end += 1;
    }
    end
}
