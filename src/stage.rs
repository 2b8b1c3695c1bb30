//! Stage - one ordered unit of a study.
//!
//! A stage owns an ordered command sequence (`command_ids`, the
//! authoritative order for rendering and serialization) and may instead
//! hold raw text when the host has not parsed it yet. The *sorted*
//! dependency order used for validity and execution is computed by the
//! orderer and cached here per structural revision.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::graph::NodeId;

/// Stable stage identity; survives persistence and is shared between
/// cases that reference the same stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub Uuid);

impl StageId {
    pub fn fresh() -> Self {
        StageId(Uuid::new_v4())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Graphical (structured command list) or raw text representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMode {
    Graphical,
    /// Raw, unparsed command text.
    Text(String),
}

/// Direction of a logical-unit file binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileDirection {
    In,
    Out,
}

/// Path bound to a logical unit number for external execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBinding {
    pub path: String,
    pub direction: FileDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) mode: StageMode,
    /// Authoritative user/insertion order; a permutation of exactly the
    /// commands owned by this stage.
    pub(crate) command_ids: Vec<NodeId>,
    /// Logical unit number -> file binding.
    pub(crate) files: BTreeMap<u32, FileBinding>,
    /// Sorted dependency order, tagged with the structural revision it
    /// was computed at.
    #[serde(skip)]
    pub(crate) order_cache: RefCell<Option<(u64, Vec<NodeId>)>>,
}

impl Stage {
    pub(crate) fn new(name: &str) -> Self {
        Stage {
            id: StageId::fresh(),
            name: name.to_string(),
            mode: StageMode::Graphical,
            command_ids: Vec::new(),
            files: BTreeMap::new(),
            order_cache: RefCell::new(None),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &StageMode {
        &self.mode
    }

    pub fn is_text(&self) -> bool {
        matches!(self.mode, StageMode::Text(_))
    }

    /// Commands in user/insertion order.
    pub fn command_ids(&self) -> &[NodeId] {
        &self.command_ids
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.command_ids.contains(&id)
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.command_ids.iter().position(|&c| c == id)
    }

    pub fn files(&self) -> &BTreeMap<u32, FileBinding> {
        &self.files
    }
}
