//! Node record and the closed set of node kinds.
//!
//! Every entity a stage can contain is one `Node` with an explicit kind
//! tag - commands, variables, hidden (macro-produced) commands, and
//! comments. Dispatch is by matching on the tag; there is no open-ended
//! visitor surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::catalog::TypeTag;
use crate::graph::NodeId;
use crate::validity::ValidityCache;
use crate::value::Keywords;

/// Closed variant set of graph entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A solver operation with catalog-defined keywords.
    Command { title: String, keywords: Keywords },
    /// A named scalar/expression; no catalog keywords.
    Variable { expression: String },
    /// Additional named output of a macro command. Its identity survives
    /// marker renames; only deletion of the marker deletes it.
    Hidden {
        producer: NodeId,
        type_tag: Option<TypeTag>,
    },
    /// Free-form comment; never carries edges, always valid.
    Comment { text: String },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Command { .. } => "command",
            NodeKind::Variable { .. } => "variable",
            NodeKind::Hidden { .. } => "hidden",
            NodeKind::Comment { .. } => "comment",
        }
    }
}

/// One graph entity: identity, name, kind, and mutual dependency edges.
///
/// `parents` are the nodes this node depends on, `children` the nodes
/// depending on it; the graph keeps the two sides mutual at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) parents: BTreeSet<NodeId>,
    pub(crate) children: BTreeSet<NodeId>,
    #[serde(skip)]
    pub(crate) validity_cache: ValidityCache,
}

impl Node {
    /// Create a detached node; it gains its id on graph insertion.
    pub fn new(name: &str, kind: NodeKind) -> Self {
        Node {
            id: NodeId::DETACHED,
            name: name.to_string(),
            kind,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            validity_cache: ValidityCache::default(),
        }
    }

    pub fn command(name: &str, title: &str, keywords: Keywords) -> Self {
        Node::new(
            name,
            NodeKind::Command {
                title: title.to_string(),
                keywords,
            },
        )
    }

    pub fn variable(name: &str, expression: &str) -> Self {
        Node::new(
            name,
            NodeKind::Variable {
                expression: expression.to_string(),
            },
        )
    }

    pub fn comment(text: &str) -> Self {
        Node::new(
            "",
            NodeKind::Comment {
                text: text.to_string(),
            },
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Catalog title for commands; `None` for other kinds.
    pub fn title(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Command { title, .. } => Some(title),
            _ => None,
        }
    }

    pub fn keywords(&self) -> Option<&Keywords> {
        match &self.kind {
            NodeKind::Command { keywords, .. } => Some(keywords),
            _ => None,
        }
    }

    /// The macro that produced this hidden command, if any.
    pub fn producer(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Hidden { producer, .. } => Some(*producer),
            _ => None,
        }
    }

    pub fn parents(&self) -> &BTreeSet<NodeId> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<NodeId> {
        &self.children
    }

    /// Whether this node takes part in name resolution.
    pub(crate) fn is_named(&self) -> bool {
        !matches!(self.kind, NodeKind::Comment { .. }) && !self.name.is_empty()
    }
}
