//! Runner boundary - read-only execution snapshots.
//!
//! External execution happens out of process; the model only hands out a
//! snapshot sufficient to drive it (ordered command lists in dependency
//! order, file bindings, execution flags) and accepts status updates
//! back through `History::record_result`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::case::{CaseId, CaseRole, ResultRecord};
use crate::error::ModelError;
use crate::exchange::VARIABLE_TITLE;
use crate::history::History;
use crate::node::NodeKind;
use crate::stage::{FileBinding, StageId, StageMode};

/// One command line of an execution snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLine {
    pub title: String,
    pub name: String,
}

/// Read-only view of one stage, ready for job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub id: StageId,
    pub name: String,
    /// 1-based position within the case.
    pub number: usize,
    /// Whether the runner should execute this stage (a run case reuses
    /// the results of its shared stages instead).
    pub execute: bool,
    /// Executed, but results not persisted for reuse.
    pub intermediate: bool,
    /// Commands in dependency order; raw text for text-mode stages.
    pub commands: Vec<CommandLine>,
    pub text: Option<String>,
    pub files: BTreeMap<u32, FileBinding>,
    pub result: Option<ResultRecord>,
}

/// Read-only view of a whole case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    pub case: CaseId,
    pub name: String,
    pub role: CaseRole,
    pub stages: Vec<StageSnapshot>,
}

impl History {
    /// Build the execution snapshot of a case. Never mutates the model.
    pub fn snapshot(&self, case_id: CaseId) -> Result<RunnerSnapshot, ModelError> {
        let case = self.require_case(case_id)?;
        let mut stages = Vec::with_capacity(case.stage_ids().len());
        for (index, &stage_id) in case.stage_ids().iter().enumerate() {
            let Some(stage) = self.stage(stage_id) else {
                continue;
            };
            let mut commands = Vec::new();
            for id in self.sorted_commands(stage_id) {
                let Some(node) = self.graph().get(id) else {
                    continue;
                };
                match node.kind() {
                    NodeKind::Command { title, .. } => commands.push(CommandLine {
                        title: title.clone(),
                        name: node.name().to_string(),
                    }),
                    NodeKind::Variable { .. } => commands.push(CommandLine {
                        title: VARIABLE_TITLE.to_string(),
                        name: node.name().to_string(),
                    }),
                    // Hidden outputs are implicit in their macro's text;
                    // comments are not executable.
                    _ => {}
                }
            }
            let text = match stage.mode() {
                StageMode::Text(text) => Some(text.clone()),
                StageMode::Graphical => None,
            };
            stages.push(StageSnapshot {
                id: stage_id,
                name: stage.name().to_string(),
                number: index + 1,
                execute: case.is_executed(stage_id),
                intermediate: case.is_intermediate(stage_id),
                commands,
                text,
                files: stage.files().clone(),
                result: case.result(stage_id).cloned(),
            });
        }
        Ok(RunnerSnapshot {
            case: case_id,
            name: case.name().to_string(),
            role: case.role(),
            stages,
        })
    }
}
