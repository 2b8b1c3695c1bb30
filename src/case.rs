//! Case - one version of a study: an ordered sequence of stages.
//!
//! Cases may share `Stage` objects (same `StageId` referenced from
//! several cases); exclusive ownership is established lazily by the
//! autocopy policy in `history`. Run and backup cases are ordinary cases
//! distinguished by a role tag, not by a different type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

use crate::stage::StageId;

/// Stable case identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseId(pub Uuid);

impl CaseId {
    pub fn fresh() -> Self {
        CaseId(Uuid::new_v4())
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role tag distinguishing derived case kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaseRole {
    /// Freely editable study version.
    #[default]
    Standard,
    /// Snapshot built for execution.
    Run,
    /// Snapshot kept for rollback.
    Backup,
}

/// Status reported back by the external runner for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Interrupted,
    Warning,
}

/// Result record stored against a stage of a case. Setting it is
/// idempotent; it never affects graph validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: RunStatus,
    pub job: Uuid,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ResultRecord {
    pub fn new(status: RunStatus) -> Self {
        ResultRecord {
            status,
            job: Uuid::new_v4(),
            at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub(crate) id: CaseId,
    pub(crate) name: String,
    pub(crate) role: CaseRole,
    /// Ordered stage references; stages themselves live in the history.
    pub(crate) stage_ids: Vec<StageId>,
    /// Stages of a run case that participate in execution but whose
    /// results are not reusable by later run cases.
    pub(crate) intermediate: BTreeSet<StageId>,
    /// Stages a run case actually executes (reused stages are not).
    #[serde(default)]
    pub(crate) executed: BTreeSet<StageId>,
    pub(crate) results: HashMap<StageId, ResultRecord>,
}

impl Case {
    pub(crate) fn new(name: &str, role: CaseRole) -> Self {
        Case {
            id: CaseId::fresh(),
            name: name.to_string(),
            role,
            stage_ids: Vec::new(),
            intermediate: BTreeSet::new(),
            executed: BTreeSet::new(),
            results: HashMap::new(),
        }
    }

    pub fn id(&self) -> CaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> CaseRole {
        self.role
    }

    pub fn stage_ids(&self) -> &[StageId] {
        &self.stage_ids
    }

    pub fn contains_stage(&self, id: StageId) -> bool {
        self.stage_ids.contains(&id)
    }

    /// 1-based stage number, recomputed from position.
    pub fn stage_number(&self, id: StageId) -> Option<usize> {
        self.stage_ids.iter().position(|&s| s == id).map(|p| p + 1)
    }

    pub fn is_intermediate(&self, id: StageId) -> bool {
        self.intermediate.contains(&id)
    }

    /// Whether a run case executes this stage; non-run cases execute
    /// every stage they contain.
    pub fn is_executed(&self, id: StageId) -> bool {
        match self.role {
            CaseRole::Run => self.executed.contains(&id),
            _ => self.contains_stage(id),
        }
    }

    pub fn result(&self, id: StageId) -> Option<&ResultRecord> {
        self.results.get(&id)
    }
}
