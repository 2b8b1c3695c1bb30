//! History - the containment hierarchy and its mutation facade.
//!
//! History owns the entity graph, the stages, and the cases; every
//! structural mutation flows through it so edges, ordering caches, and
//! validity caches stay consistent. Exactly one case is "current" at all
//! times.
//!
//! Stage sharing follows the copy-on-write ("autocopy") policy: inside
//! an autocopy bracket, the first mutation of a stage shared with
//! another case transparently clones just that stage for the mutating
//! case; outside the bracket, mutating a shared stage is a deliberate
//! in-place broadcast to every sharer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::case::{Case, CaseId, CaseRole, ResultRecord, RunStatus};
use crate::catalog::{Catalog, DefinitionKind, TypeTag};
use crate::error::{ModelError, StateError, StructuralError};
use crate::expansion;
use crate::graph::{EntityGraph, NodeId};
use crate::naming::{auto_name, validate_name, Scope};
use crate::node::{Node, NodeKind};
use crate::order;
use crate::stage::{FileBinding, Stage, StageId};
use crate::validity::{self, Checker, Validity};
use crate::value::{keyword_refs, map_keywords, KeywordValue, Keywords};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    graph: EntityGraph,
    catalog: Catalog,
    stages: HashMap<StageId, Stage>,
    cases: Vec<Case>,
    current: CaseId,
    /// Owning stage of every command node.
    command_stage: HashMap<NodeId, StageId>,
    #[serde(skip)]
    autocopy: bool,
    /// Structural revision; every cache is tagged with the revision it
    /// was computed at.
    #[serde(skip)]
    revision: u64,
}

impl History {
    /// Create a history with an empty current case.
    pub fn new(catalog: Catalog) -> Self {
        let case = Case::new("current", CaseRole::Standard);
        let current = case.id();
        History {
            graph: EntityGraph::new(),
            catalog,
            stages: HashMap::new(),
            cases: vec![case],
            current,
            command_stage: HashMap::new(),
            autocopy: false,
            revision: 0,
        }
    }

    // -----------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }

    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.cases.iter()
    }

    pub fn case(&self, id: CaseId) -> Option<&Case> {
        self.cases.iter().find(|c| c.id() == id)
    }

    pub(crate) fn require_case(&self, id: CaseId) -> Result<&Case, StructuralError> {
        self.case(id).ok_or(StructuralError::UnknownCase {
            id: id.to_string(),
        })
    }

    fn case_mut(&mut self, id: CaseId) -> Result<&mut Case, StructuralError> {
        self.cases
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(StructuralError::UnknownCase {
                id: id.to_string(),
            })
    }

    pub fn current_case_id(&self) -> CaseId {
        self.current
    }

    pub fn current_case(&self) -> &Case {
        self.case(self.current).expect("current case always exists")
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(&id)
    }

    pub(crate) fn stage_mut(&mut self, id: StageId) -> Option<&mut Stage> {
        self.stages.get_mut(&id)
    }

    fn require_stage(&self, id: StageId) -> Result<&Stage, StructuralError> {
        self.stage(id).ok_or(StructuralError::UnknownStage {
            id: id.to_string(),
        })
    }

    /// Owning stage of a command node.
    pub fn stage_of(&self, id: NodeId) -> Option<StageId> {
        self.command_stage.get(&id).copied()
    }

    /// Number of cases referencing a stage.
    pub fn ref_count(&self, stage: StageId) -> usize {
        self.cases.iter().filter(|c| c.contains_stage(stage)).count()
    }

    /// Result type produced by a node, when known.
    pub(crate) fn produced_type(&self, id: NodeId) -> Option<TypeTag> {
        let node = self.graph.get(id)?;
        match node.kind() {
            NodeKind::Command { title, keywords } => {
                self.catalog.definition(title)?.produced_type(keywords)
            }
            NodeKind::Hidden { type_tag, .. } => type_tag.clone(),
            _ => None,
        }
    }

    fn require_membership(&self, case_id: CaseId, stage_id: StageId) -> Result<(), ModelError> {
        let case = self.require_case(case_id)?;
        if !case.contains_stage(stage_id) {
            return Err(StructuralError::StageNotInCase {
                stage: stage_id.to_string(),
                case: case.name().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn require_command_stage(&self, id: NodeId) -> Result<StageId, StructuralError> {
        self.stage_of(id)
            .ok_or(StructuralError::UnknownNode { id })
    }

    // -----------------------------------------------------------------
    // Ordering and resolution
    // -----------------------------------------------------------------

    /// Sorted dependency order of a stage, cached per structural
    /// revision. Always a valid topological order of the real edge set.
    pub fn sorted_commands(&self, stage_id: StageId) -> Vec<NodeId> {
        let Some(stage) = self.stages.get(&stage_id) else {
            return Vec::new();
        };
        if let Some((revision, cached)) = stage.order_cache.borrow().as_ref() {
            if *revision == self.revision {
                return cached.clone();
            }
        }
        let sorted = order::sort_stage(&self.graph, &self.catalog, stage);
        *stage.order_cache.borrow_mut() = Some((self.revision, sorted.clone()));
        sorted
    }

    /// Visibility scope of `stage_id` within `case_id`: the stage's own
    /// commands plus everything in preceding stages of the case.
    pub fn scope(&self, case_id: CaseId, stage_id: StageId) -> Result<Scope<'_>, ModelError> {
        let case = self.require_case(case_id)?;
        self.scope_in(case, stage_id).ok_or_else(|| {
            StructuralError::StageNotInCase {
                stage: stage_id.to_string(),
                case: case.name().to_string(),
            }
            .into()
        })
    }

    pub(crate) fn scope_in(&self, case: &Case, stage_id: StageId) -> Option<Scope<'_>> {
        let idx = case.stage_ids.iter().position(|&s| s == stage_id)?;
        let chain = (0..=idx)
            .rev()
            .map(|i| self.sorted_commands(case.stage_ids[i]))
            .collect();
        Some(Scope::new(&self.graph, chain))
    }

    // -----------------------------------------------------------------
    // Validity
    // -----------------------------------------------------------------

    /// Safe check of one command; catalog violations become `SYNTAXIC`.
    pub fn check_command(&self, case_id: CaseId, command: NodeId) -> Result<Validity, ModelError> {
        let case = self.require_case(case_id)?;
        Ok(Checker { history: self, case }.command(command))
    }

    /// Strict check: the command's own catalog violation propagates as
    /// an error, for diagnostic tooling.
    pub fn check_command_strict(
        &self,
        case_id: CaseId,
        command: NodeId,
    ) -> Result<Validity, ModelError> {
        let case = self.require_case(case_id)?;
        Ok(Checker { history: self, case }.command_strict(command)?)
    }

    pub fn check_stage(&self, case_id: CaseId, stage_id: StageId) -> Result<Validity, ModelError> {
        self.require_membership(case_id, stage_id)?;
        let case = self.require_case(case_id)?;
        Ok(Checker { history: self, case }.stage(stage_id))
    }

    pub fn check_case(&self, case_id: CaseId) -> Result<Validity, ModelError> {
        let case = self.require_case(case_id)?;
        Ok(Checker { history: self, case }.case())
    }

    /// Re-resolve broken references in a case; returns residual validity.
    pub fn repair_case(&mut self, case_id: CaseId) -> Result<Validity, ModelError> {
        validity::repair(self, case_id)
    }

    // -----------------------------------------------------------------
    // Autocopy
    // -----------------------------------------------------------------

    /// Enable or disable the copy-on-write bracket for following edits.
    pub fn set_autocopy(&mut self, enabled: bool) {
        self.autocopy = enabled;
    }

    pub fn autocopy(&self) -> bool {
        self.autocopy
    }

    /// Make `stage_id` safe to mutate on behalf of `case_id`. Inside an
    /// autocopy bracket a shared stage is cloned for the mutating case
    /// and the returned mapping translates old node ids to clones.
    pub(crate) fn prepare_stage(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
    ) -> Result<(StageId, HashMap<NodeId, NodeId>), ModelError> {
        self.require_membership(case_id, stage_id)?;
        if !self.autocopy || self.ref_count(stage_id) <= 1 {
            return Ok((stage_id, HashMap::new()));
        }
        let (clone_id, mapping) = self.clone_stage(stage_id);
        debug!(source = %stage_id, clone = %clone_id, case = %case_id, "autocopy cloned shared stage");

        let case = self.case_mut(case_id)?;
        let position = case
            .stage_ids
            .iter()
            .position(|&s| s == stage_id)
            .expect("membership checked above");
        case.stage_ids[position] = clone_id;
        if case.intermediate.remove(&stage_id) {
            case.intermediate.insert(clone_id);
        }
        if case.executed.remove(&stage_id) {
            case.executed.insert(clone_id);
        }
        case.results.remove(&stage_id);

        // References from stages this case owns exclusively follow the
        // clone; still-shared stages keep pointing at the original, which
        // stays valid in the sharers' own chains.
        let stage_list = self.require_case(case_id)?.stage_ids.clone();
        let exclusive: Vec<StageId> = stage_list
            .into_iter()
            .filter(|&s| s != clone_id && self.ref_count(s) == 1)
            .collect();
        for stage in exclusive {
            self.rewire_refs_in_stage(stage, &mapping);
        }
        self.bump_revision();
        Ok((clone_id, mapping))
    }

    /// Deep-clone a stage: fresh stage id, fresh node ids, internal
    /// references and edges rewired to the clones, references to nodes
    /// outside the stage preserved. Touches no case.
    fn clone_stage(&mut self, source: StageId) -> (StageId, HashMap<NodeId, NodeId>) {
        let source_stage = self.stages.get(&source).expect("source stage exists");
        let mut clone = Stage::new(&source_stage.name);
        clone.mode = source_stage.mode.clone();
        clone.files = source_stage.files.clone();
        let originals: Vec<(NodeId, String, NodeKind)> = source_stage
            .command_ids
            .iter()
            .filter_map(|&id| {
                self.graph
                    .get(id)
                    .map(|n| (id, n.name().to_string(), n.kind().clone()))
            })
            .collect();

        let clone_id = clone.id();
        let mut mapping: HashMap<NodeId, NodeId> = HashMap::new();
        for (old_id, name, kind) in &originals {
            let new_id = self
                .graph
                .add(Node::new(name, kind.clone()), None)
                .expect("fresh node is detached");
            mapping.insert(*old_id, new_id);
            clone.command_ids.push(new_id);
            self.command_stage.insert(new_id, clone_id);
        }
        self.stages.insert(clone_id, clone);

        for (old_id, _, _) in &originals {
            let new_id = mapping[old_id];
            if let Some(node) = self.graph.get_mut(new_id) {
                match &mut node.kind {
                    NodeKind::Command { keywords, .. } => {
                        let owned = std::mem::take(keywords);
                        *keywords = map_keywords(owned, &mut |value| match value {
                            KeywordValue::Ref(target) => {
                                KeywordValue::Ref(mapping.get(&target).copied().unwrap_or(target))
                            }
                            other => other,
                        });
                    }
                    NodeKind::Hidden { producer, .. } => {
                        if let Some(&mapped) = mapping.get(producer) {
                            *producer = mapped;
                        }
                    }
                    _ => {}
                }
            }
            let parents: Vec<NodeId> = self
                .graph
                .get(*old_id)
                .map(|n| n.parents().iter().copied().collect())
                .unwrap_or_default();
            for parent in parents {
                let parent = mapping.get(&parent).copied().unwrap_or(parent);
                // Mirrors an acyclic structure; cannot fail.
                let _ = self.graph.add_edge(parent, new_id);
            }
        }
        (clone_id, mapping)
    }

    /// Rewrite references (keywords and edges) in one stage according to
    /// an old-id -> new-id mapping.
    fn rewire_refs_in_stage(&mut self, stage_id: StageId, mapping: &HashMap<NodeId, NodeId>) {
        let ids: Vec<NodeId> = self
            .stages
            .get(&stage_id)
            .map(|s| s.command_ids.clone())
            .unwrap_or_default();
        for id in ids {
            let hits: Vec<NodeId> = self
                .graph
                .get(id)
                .and_then(|n| n.keywords())
                .map(keyword_refs)
                .unwrap_or_default()
                .into_iter()
                .filter(|r| mapping.contains_key(r))
                .collect();
            if hits.is_empty() {
                continue;
            }
            if let Some(node) = self.graph.get_mut(id) {
                if let NodeKind::Command { keywords, .. } = &mut node.kind {
                    let owned = std::mem::take(keywords);
                    *keywords = map_keywords(owned, &mut |value| match value {
                        KeywordValue::Ref(target) => {
                            KeywordValue::Ref(mapping.get(&target).copied().unwrap_or(target))
                        }
                        other => other,
                    });
                }
            }
            for old in hits {
                let new = mapping[&old];
                self.graph.remove_edge(old, id);
                let _ = self.graph.add_edge(new, id);
            }
        }
    }

    // -----------------------------------------------------------------
    // Stage mutation
    // -----------------------------------------------------------------

    /// Append a stage to a case. The name must be unique within the case
    /// (case-sensitive) at creation.
    pub fn add_stage(&mut self, case_id: CaseId, name: &str) -> Result<StageId, ModelError> {
        let case = self.require_case(case_id)?;
        if case
            .stage_ids
            .iter()
            .any(|s| self.stages.get(s).map(|st| st.name() == name).unwrap_or(false))
        {
            return Err(StateError::DuplicateStageName {
                case: case.name().to_string(),
                name: name.to_string(),
            }
            .into());
        }
        let stage = Stage::new(name);
        let id = stage.id();
        self.stages.insert(id, stage);
        self.case_mut(case_id)?.stage_ids.push(id);
        self.bump_revision();
        debug!(case = %case_id, stage = %id, name = %name, "stage added");
        Ok(id)
    }

    /// Remove a stage from a case; the stage and its commands are
    /// destroyed once no case references it.
    pub fn remove_stage(&mut self, case_id: CaseId, stage_id: StageId) -> Result<(), ModelError> {
        self.require_membership(case_id, stage_id)?;
        self.case_mut(case_id)?.stage_ids.retain(|&s| s != stage_id);
        self.case_mut(case_id)?.results.remove(&stage_id);
        self.gc_stages(&[stage_id]);
        self.bump_revision();
        Ok(())
    }

    pub fn rename_stage(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        name: &str,
    ) -> Result<StageId, ModelError> {
        let case = self.require_case(case_id)?;
        if case.stage_ids.iter().any(|s| {
            *s != stage_id && self.stages.get(s).map(|st| st.name() == name).unwrap_or(false)
        }) {
            return Err(StateError::DuplicateStageName {
                case: case.name().to_string(),
                name: name.to_string(),
            }
            .into());
        }
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        if let Some(stage) = self.stages.get_mut(&stage_id) {
            stage.name = name.to_string();
        }
        self.bump_revision();
        Ok(stage_id)
    }

    /// Bind or clear a logical unit file for a stage.
    pub fn set_file(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        unit: u32,
        binding: Option<FileBinding>,
    ) -> Result<StageId, ModelError> {
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let stage = self.stages.get_mut(&stage_id).expect("prepared stage exists");
        match binding {
            Some(binding) => {
                stage.files.insert(unit, binding);
            }
            None => {
                stage.files.remove(&unit);
            }
        }
        self.bump_revision();
        Ok(stage_id)
    }

    // -----------------------------------------------------------------
    // Command mutation
    // -----------------------------------------------------------------

    /// Add a command to a stage. Without an explicit name one is derived
    /// from the title when the command produces a result; commands that
    /// produce nothing stay unnamed.
    pub fn add_command(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        title: &str,
        name: Option<&str>,
    ) -> Result<NodeId, ModelError> {
        self.require_graphical(stage_id)?;
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let produces = self
            .catalog
            .definition(title)
            .map(|d| d.result.is_some() || d.kind == DefinitionKind::Macro)
            .unwrap_or(true);
        let name = match name {
            Some(n) if !n.is_empty() => {
                validate_name(n)?;
                n.to_string()
            }
            _ if produces => {
                let case = self.require_case(case_id)?;
                let scope = self
                    .scope_in(case, stage_id)
                    .expect("membership checked by prepare_stage");
                auto_name(title, &|candidate| scope.exists(candidate))
            }
            _ => String::new(),
        };
        let id = self.insert_node(stage_id, Node::command(&name, title, vec![]), None, None)?;
        self.bump_revision();
        debug!(stage = %stage_id, command = %id, title = %title, name = %name, "command added");
        Ok(id)
    }

    /// Add a named variable to a stage.
    pub fn add_variable(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        name: &str,
        expression: &str,
    ) -> Result<NodeId, ModelError> {
        self.require_graphical(stage_id)?;
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        validate_name(name)?;
        let id = self.insert_node(stage_id, Node::variable(name, expression), None, None)?;
        self.bump_revision();
        Ok(id)
    }

    pub fn add_comment(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        text: &str,
    ) -> Result<NodeId, ModelError> {
        self.require_graphical(stage_id)?;
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let id = self.insert_node(stage_id, Node::comment(text), None, None)?;
        self.bump_revision();
        Ok(id)
    }

    /// Replace a command's keyword values. Dependency edges follow the
    /// references in the new values; an edit that would close a cycle
    /// fails and leaves the command exactly as it was. Macro hidden
    /// outputs are reconciled afterwards.
    ///
    /// Returns the command id, remapped if autocopy cloned the stage.
    pub fn set_keywords(
        &mut self,
        case_id: CaseId,
        command: NodeId,
        keywords: Keywords,
    ) -> Result<NodeId, ModelError> {
        let stage_id = self.require_command_stage(command)?;
        let (_, mapping) = self.prepare_stage(case_id, stage_id)?;
        let command = mapping.get(&command).copied().unwrap_or(command);

        let node = self
            .graph
            .get(command)
            .ok_or(StructuralError::UnknownNode { id: command })?;
        let old = match node.kind() {
            NodeKind::Command { keywords, .. } => keywords.clone(),
            NodeKind::Hidden { .. } => {
                return Err(StateError::HiddenCommand {
                    name: node.name().to_string(),
                    operation: "edited".to_string(),
                }
                .into())
            }
            _ => {
                return Err(StructuralError::WrongKind {
                    id: command,
                    expected: "command".to_string(),
                }
                .into())
            }
        };

        let old_refs: BTreeSet<NodeId> = keyword_refs(&old).into_iter().collect();
        let new_refs: BTreeSet<NodeId> = keyword_refs(&keywords).into_iter().collect();
        let removed: Vec<NodeId> = old_refs.difference(&new_refs).copied().collect();
        let added: Vec<NodeId> = new_refs.difference(&old_refs).copied().collect();

        for &gone in &removed {
            self.graph.remove_edge(gone, command);
        }
        let mut applied = Vec::new();
        for &target in &added {
            match self.graph.add_edge(target, command) {
                Ok(()) => applied.push(target),
                Err(err) => {
                    // Leave the graph exactly as it was before the call.
                    for &undo in &applied {
                        self.graph.remove_edge(undo, command);
                    }
                    for &back in &removed {
                        let _ = self.graph.add_edge(back, command);
                    }
                    return Err(err.into());
                }
            }
        }

        if let Some(node) = self.graph.get_mut(command) {
            if let NodeKind::Command { keywords: slot, .. } = &mut node.kind {
                *slot = keywords;
            }
        }
        expansion::reconcile(self, command);
        self.bump_revision();
        Ok(command)
    }

    /// Replace a variable's expression.
    pub fn set_expression(
        &mut self,
        case_id: CaseId,
        variable: NodeId,
        expression: &str,
    ) -> Result<NodeId, ModelError> {
        let stage_id = self.require_command_stage(variable)?;
        let (_, mapping) = self.prepare_stage(case_id, stage_id)?;
        let variable = mapping.get(&variable).copied().unwrap_or(variable);
        let node = self
            .graph
            .get_mut(variable)
            .ok_or(StructuralError::UnknownNode { id: variable })?;
        match &mut node.kind {
            NodeKind::Variable { expression: slot } => {
                *slot = expression.to_string();
            }
            _ => {
                return Err(StructuralError::WrongKind {
                    id: variable,
                    expected: "variable".to_string(),
                }
                .into())
            }
        }
        self.bump_revision();
        Ok(variable)
    }

    /// Rename a command. Edges are untouched: dependents keep pointing
    /// at the same id and resolution is always live, so they are only
    /// affected if the new name collides with something.
    pub fn rename_command(
        &mut self,
        case_id: CaseId,
        command: NodeId,
        name: &str,
    ) -> Result<NodeId, ModelError> {
        validate_name(name)?;
        let stage_id = self.require_command_stage(command)?;
        let (_, mapping) = self.prepare_stage(case_id, stage_id)?;
        let command = mapping.get(&command).copied().unwrap_or(command);
        let node = self
            .graph
            .get_mut(command)
            .ok_or(StructuralError::UnknownNode { id: command })?;
        if matches!(node.kind, NodeKind::Hidden { .. }) {
            return Err(StateError::HiddenCommand {
                name: node.name.clone(),
                operation: "renamed".to_string(),
            }
            .into());
        }
        debug!(command = %command, from = %node.name, to = %name, "command renamed");
        node.name = name.to_string();
        self.bump_revision();
        Ok(command)
    }

    /// Delete a command. Its hidden outputs (if it is a macro) go with
    /// it; commands that referenced it are *not* deleted - their
    /// references break and they surface `DEPENDENCY` on the next check.
    pub fn remove_command(&mut self, case_id: CaseId, command: NodeId) -> Result<(), ModelError> {
        let stage_id = self.require_command_stage(command)?;
        let (stage_id, mapping) = self.prepare_stage(case_id, stage_id)?;
        let command = mapping.get(&command).copied().unwrap_or(command);
        let node = self
            .graph
            .get(command)
            .ok_or(StructuralError::UnknownNode { id: command })?;
        if matches!(node.kind(), NodeKind::Hidden { .. }) {
            return Err(StateError::HiddenCommand {
                name: node.name().to_string(),
                operation: "deleted".to_string(),
            }
            .into());
        }
        let hiddens: Vec<NodeId> = self
            .stages
            .get(&stage_id)
            .map(|stage| {
                stage
                    .command_ids
                    .iter()
                    .copied()
                    .filter(|&id| {
                        self.graph
                            .get(id)
                            .and_then(|n| n.producer())
                            .map(|p| p == command)
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for hidden in hiddens {
            self.delete_node_cascade(hidden);
        }
        self.delete_node_cascade(command);
        self.bump_revision();
        Ok(())
    }

    /// Remove one node: break every dependent's reference into a textual
    /// `Name` (repairable), drop it from its stage, and delete it from
    /// the graph with all incident edges.
    pub(crate) fn delete_node_cascade(&mut self, id: NodeId) {
        let Some(node) = self.graph.get(id) else {
            return;
        };
        let name = node.name().to_string();
        let children: Vec<NodeId> = node.children().iter().copied().collect();
        for child in children {
            if let Some(child_node) = self.graph.get_mut(child) {
                if let NodeKind::Command { keywords, .. } = &mut child_node.kind {
                    let owned = std::mem::take(keywords);
                    *keywords = map_keywords(owned, &mut |value| match value {
                        KeywordValue::Ref(target) if target == id => {
                            KeywordValue::Name(name.clone())
                        }
                        other => other,
                    });
                }
            }
        }
        if let Some(stage_id) = self.command_stage.remove(&id) {
            if let Some(stage) = self.stages.get_mut(&stage_id) {
                stage.command_ids.retain(|&c| c != id);
            }
        }
        self.graph.remove(id);
        debug!(node = %id, name = %name, "node removed");
    }

    /// Insert an already-built node into a stage, optionally at a fixed
    /// position and with an initial parent edge.
    pub(crate) fn insert_node(
        &mut self,
        stage_id: StageId,
        node: Node,
        position: Option<usize>,
        parent: Option<NodeId>,
    ) -> Result<NodeId, ModelError> {
        self.require_stage(stage_id)?;
        let id = self.graph.add(node, parent)?;
        let stage = self.stages.get_mut(&stage_id).expect("checked above");
        match position {
            Some(p) if p <= stage.command_ids.len() => stage.command_ids.insert(p, id),
            _ => stage.command_ids.push(id),
        }
        self.command_stage.insert(id, stage_id);
        Ok(id)
    }

    fn require_graphical(&self, stage_id: StageId) -> Result<(), ModelError> {
        let stage = self.require_stage(stage_id)?;
        if stage.is_text() {
            return Err(StateError::TextModeStage {
                name: stage.name().to_string(),
            }
            .into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Case lifecycle
    // -----------------------------------------------------------------

    pub fn rename_case(&mut self, case_id: CaseId, name: &str) -> Result<(), ModelError> {
        self.case_mut(case_id)?.name = name.to_string();
        Ok(())
    }

    pub fn set_current_case(&mut self, case_id: CaseId) -> Result<(), ModelError> {
        self.require_case(case_id)?;
        self.current = case_id;
        Ok(())
    }

    /// Copy a case by *sharing* its stages: the new case references the
    /// same stage objects as long as they are unmodified.
    pub fn copy_case(&mut self, source: CaseId, name: &str) -> Result<CaseId, ModelError> {
        let source_case = self.require_case(source)?;
        let mut case = Case::new(name, CaseRole::Standard);
        case.stage_ids = source_case.stage_ids.clone();
        let id = case.id();
        self.cases.push(case);
        self.bump_revision();
        debug!(source = %source, copy = %id, name = %name, "case copied (stages shared)");
        Ok(id)
    }

    /// Build a run case from the current case: stages listed as reusable
    /// are shared verbatim, every other selected stage is deep-cloned
    /// and flagged intermediate (executed, results not reusable).
    pub fn create_run_case(
        &mut self,
        name: &str,
        exec: &[StageId],
        reusable: &[StageId],
    ) -> Result<CaseId, ModelError> {
        let current = self.current_case().clone();
        for &stage in exec.iter().chain(reusable) {
            if !current.contains_stage(stage) {
                return Err(StructuralError::StageNotInCase {
                    stage: stage.to_string(),
                    case: current.name().to_string(),
                }
                .into());
            }
        }
        let selected: Vec<StageId> = current
            .stage_ids
            .iter()
            .copied()
            .filter(|s| exec.contains(s) || reusable.contains(s))
            .collect();

        let mut case = Case::new(name, CaseRole::Run);
        let mut node_map: HashMap<NodeId, NodeId> = HashMap::new();
        let mut stage_map: HashMap<StageId, StageId> = HashMap::new();
        for stage in selected {
            if reusable.contains(&stage) {
                case.stage_ids.push(stage);
                stage_map.insert(stage, stage);
            } else {
                let (clone_id, mapping) = self.clone_stage(stage);
                node_map.extend(mapping);
                case.stage_ids.push(clone_id);
                stage_map.insert(stage, clone_id);
                case.intermediate.insert(clone_id);
            }
        }
        case.executed = exec.iter().map(|s| stage_map[s]).collect();

        // Cross-stage references between cloned stages follow the clones.
        let cloned: Vec<StageId> = case
            .stage_ids
            .iter()
            .copied()
            .filter(|s| self.ref_count(*s) == 0)
            .collect();
        for stage in cloned {
            self.rewire_refs_in_stage(stage, &node_map);
        }

        let id = case.id();
        debug!(run_case = %id, name = %name, stages = case.stage_ids.len(), "run case created");
        self.cases.push(case);
        self.bump_revision();
        Ok(id)
    }

    /// Snapshot the current case's stages (shared) for rollback.
    pub fn create_backup_case(&mut self, name: &str) -> CaseId {
        let mut case = Case::new(name, CaseRole::Backup);
        case.stage_ids = self.current_case().stage_ids.clone();
        let id = case.id();
        self.cases.push(case);
        self.bump_revision();
        debug!(backup = %id, name = %name, "backup case created");
        id
    }

    /// Rebuild the current case's stage list from a backup. Stages the
    /// current case no longer references anywhere are destroyed.
    pub fn restore_backup(&mut self, backup: CaseId) -> Result<(), ModelError> {
        let backup_case = self.require_case(backup)?;
        if backup_case.role() != CaseRole::Backup {
            return Err(StateError::NotABackup {
                name: backup_case.name().to_string(),
            }
            .into());
        }
        let restored = backup_case.stage_ids.clone();
        let current = self.current;
        let previous = std::mem::replace(&mut self.case_mut(current)?.stage_ids, restored);
        self.gc_stages(&previous);
        self.bump_revision();
        debug!(backup = %backup, "current case restored from backup");
        Ok(())
    }

    /// Delete a case. The current case can never be deleted. Cases that
    /// depend on it - created later and sharing one of its stages,
    /// transitively - are deleted first.
    pub fn remove_case(&mut self, case_id: CaseId) -> Result<(), ModelError> {
        if case_id == self.current {
            return Err(StateError::CurrentCaseDelete {
                name: self.current_case().name().to_string(),
            }
            .into());
        }
        let target = self
            .cases
            .iter()
            .position(|c| c.id() == case_id)
            .ok_or(StructuralError::UnknownCase {
                id: case_id.to_string(),
            })?;

        let mut doomed: BTreeSet<usize> = BTreeSet::from([target]);
        loop {
            let mut grown = false;
            for (i, case) in self.cases.iter().enumerate() {
                if doomed.contains(&i) {
                    continue;
                }
                let depends = doomed.iter().any(|&d| {
                    d < i
                        && self.cases[d]
                            .stage_ids
                            .iter()
                            .any(|s| case.contains_stage(*s))
                });
                if depends {
                    doomed.insert(i);
                    grown = true;
                }
            }
            if !grown {
                break;
            }
        }
        if let Some(current_pos) = self.cases.iter().position(|c| c.id() == self.current) {
            if doomed.contains(&current_pos) {
                return Err(StateError::CascadeIntoCurrent {
                    name: self.cases[target].name().to_string(),
                }
                .into());
            }
        }

        let mut orphaned: Vec<StageId> = Vec::new();
        for &i in doomed.iter().rev() {
            let case = self.cases.remove(i);
            debug!(case = %case.id(), name = %case.name(), "case deleted");
            orphaned.extend(case.stage_ids);
        }
        self.gc_stages(&orphaned);
        self.bump_revision();
        Ok(())
    }

    /// Destroy stages no case references anymore.
    fn gc_stages(&mut self, candidates: &[StageId]) {
        for &stage_id in candidates {
            if self.ref_count(stage_id) > 0 {
                continue;
            }
            let Some(stage) = self.stages.remove(&stage_id) else {
                continue;
            };
            debug!(stage = %stage_id, name = %stage.name(), "stage destroyed");
            for id in stage.command_ids {
                self.delete_node_cascade(id);
            }
        }
    }

    // -----------------------------------------------------------------
    // Runner feedback
    // -----------------------------------------------------------------

    /// Store the status reported by the external runner for one stage of
    /// a case. Idempotent: recording over an existing result replaces it
    /// and never touches graph validity.
    pub fn record_result(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        status: RunStatus,
        messages: Vec<String>,
    ) -> Result<(), ModelError> {
        self.require_membership(case_id, stage_id)?;
        let mut record = ResultRecord::new(status);
        record.messages = messages;
        self.case_mut(case_id)?.results.insert(stage_id, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CycleError, StateError};

    const CATALOG: &str = r#"
version: "test"
commands:
  - title: DEBUT
    category: 0
    kind: starter
  - title: LIRE_MAILLAGE
    category: 1
    result: maillage
    keywords:
      - name: UNITE
        value: int
  - title: MACR_ADAP_MAIL
    category: 1
    kind: macro
    keywords:
      - name: MAILLAGE_NP1
        value: output
        of: maillage
  - title: DEFI_GROUP
    category: 1
    result: maillage
    keywords:
      - name: MAILLAGE
        required: true
        value: reference
        of: maillage
  - title: AFFE_MODELE
    category: 2
    result: modele
    keywords:
      - name: MAILLAGE
        required: true
        value: reference
        of: maillage
  - title: DETRUIRE
    category: 9
    kind: deleter
    keywords:
      - name: CONCEPT
        value: reference
        many: true
"#;

    fn history() -> (History, CaseId, StageId) {
        let catalog = Catalog::from_yaml(CATALOG).unwrap();
        let mut history = History::new(catalog);
        let case = history.current_case_id();
        let stage = history.add_stage(case, "s1").unwrap();
        (history, case, stage)
    }

    fn mesh_and_model(history: &mut History, case: CaseId, stage: StageId) -> (NodeId, NodeId) {
        let mesh = history
            .add_command(case, stage, "LIRE_MAILLAGE", Some("mesh"))
            .unwrap();
        let model = history
            .add_command(case, stage, "AFFE_MODELE", Some("model"))
            .unwrap();
        history
            .set_keywords(
                case,
                model,
                vec![("MAILLAGE".to_string(), KeywordValue::Ref(mesh))],
            )
            .unwrap();
        (mesh, model)
    }

    #[test]
    fn test_add_command_auto_name() {
        let (mut history, case, stage) = history();
        let first = history
            .add_command(case, stage, "LIRE_MAILLAGE", None)
            .unwrap();
        let second = history
            .add_command(case, stage, "LIRE_MAILLAGE", None)
            .unwrap();
        assert_eq!(history.graph().get(first).unwrap().name(), "lire_mai");
        assert_eq!(history.graph().get(second).unwrap().name(), "lire_ma0");
        // Deleters produce nothing and stay unnamed
        let deleter = history.add_command(case, stage, "DETRUIRE", None).unwrap();
        assert_eq!(history.graph().get(deleter).unwrap().name(), "");
    }

    #[test]
    fn test_set_keywords_maintains_edges() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        assert!(history.graph().get(model).unwrap().parents().contains(&mesh));
        // Dropping the reference drops the edge
        history.set_keywords(case, model, vec![]).unwrap();
        assert!(history.graph().get(model).unwrap().parents().is_empty());
        assert!(history.graph().get(mesh).unwrap().children().is_empty());
    }

    #[test]
    fn test_cycle_rolls_back_cleanly() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        let err = history
            .set_keywords(
                case,
                mesh,
                vec![("UNITE".to_string(), KeywordValue::Ref(model))],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::Cycle(CycleError::WouldCycle { .. })
        ));
        // The offending call left the graph exactly as it was
        let mesh_node = history.graph().get(mesh).unwrap();
        assert!(mesh_node.keywords().unwrap().is_empty());
        assert!(mesh_node.parents().is_empty());
        assert!(history.graph().get(model).unwrap().parents().contains(&mesh));
    }

    #[test]
    fn test_deletion_cascade_keeps_dependents() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        history.remove_command(case, mesh).unwrap();
        assert!(history.graph().get(mesh).is_none());
        // The dependent survives and reports the broken dependency
        let flags = history.check_command(case, model).unwrap();
        assert!(flags.contains(Validity::DEPENDENCY));
        assert!(history
            .check_case(case)
            .unwrap()
            .contains(Validity::DEPENDENCY));
    }

    #[test]
    fn test_rename_preserves_edges() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        let before_parents = history.graph().get(mesh).unwrap().parents().clone();
        let before_children = history.graph().get(mesh).unwrap().children().clone();
        history.rename_command(case, mesh, "grid").unwrap();
        let node = history.graph().get(mesh).unwrap();
        assert_eq!(node.name(), "grid");
        assert_eq!(node.parents(), &before_parents);
        assert_eq!(node.children(), &before_children);
        // Resolution follows the rename; the dependent is unaffected
        let scope = history.scope(case, stage).unwrap();
        assert_eq!(scope.resolve("grid").unwrap(), mesh);
        assert!(scope.resolve("mesh").is_err());
        drop(scope);
        assert_eq!(history.check_command(case, model).unwrap(), Validity::NOTHING);
    }

    #[test]
    fn test_naming_conflict_and_recovery() {
        let (mut history, case, stage) = history();
        let a = history
            .add_command(case, stage, "LIRE_MAILLAGE", Some("Mesh"))
            .unwrap();
        let b = history
            .add_command(case, stage, "LIRE_MAILLAGE", Some("Mesh"))
            .unwrap();
        assert!(history
            .check_command(case, a)
            .unwrap()
            .contains(Validity::NAMING));
        assert!(history
            .check_command(case, b)
            .unwrap()
            .contains(Validity::NAMING));
        history.rename_command(case, b, "Mesh2").unwrap();
        assert_eq!(history.check_command(case, a).unwrap(), Validity::NOTHING);
        assert_eq!(history.check_command(case, b).unwrap(), Validity::NOTHING);
    }

    #[test]
    fn test_macro_rename_keeps_hidden_identity() {
        let (mut history, case, stage) = history();
        let adapt = history
            .add_command(case, stage, "MACR_ADAP_MAIL", None)
            .unwrap();
        history
            .set_keywords(
                case,
                adapt,
                vec![(
                    "MAILLAGE_NP1".to_string(),
                    KeywordValue::NewOutput("meshout".to_string()),
                )],
            )
            .unwrap();
        let hidden = history.scope(case, stage).unwrap().resolve("meshout").unwrap();
        // A dependent that must stay valid across marker renames
        let group = history
            .add_command(case, stage, "DEFI_GROUP", Some("mesh2"))
            .unwrap();
        history
            .set_keywords(
                case,
                group,
                vec![("MAILLAGE".to_string(), KeywordValue::Ref(hidden))],
            )
            .unwrap();
        assert_eq!(history.check_command(case, group).unwrap(), Validity::NOTHING);

        for marker in ["meshadap", "meshout"] {
            history
                .set_keywords(
                    case,
                    adapt,
                    vec![(
                        "MAILLAGE_NP1".to_string(),
                        KeywordValue::NewOutput(marker.to_string()),
                    )],
                )
                .unwrap();
            let resolved = history.scope(case, stage).unwrap().resolve(marker).unwrap();
            assert_eq!(resolved, hidden, "rename must preserve identity");
            assert_eq!(
                history.check_command(case, group).unwrap(),
                Validity::NOTHING,
                "dependent must never break across a marker rename"
            );
        }
    }

    #[test]
    fn test_macro_delete_cascades_to_hidden() {
        let (mut history, case, stage) = history();
        let adapt = history
            .add_command(case, stage, "MACR_ADAP_MAIL", None)
            .unwrap();
        history
            .set_keywords(
                case,
                adapt,
                vec![(
                    "MAILLAGE_NP1".to_string(),
                    KeywordValue::NewOutput("meshout".to_string()),
                )],
            )
            .unwrap();
        let hidden = history.scope(case, stage).unwrap().resolve("meshout").unwrap();
        let group = history
            .add_command(case, stage, "DEFI_GROUP", Some("mesh2"))
            .unwrap();
        history
            .set_keywords(
                case,
                group,
                vec![("MAILLAGE".to_string(), KeywordValue::Ref(hidden))],
            )
            .unwrap();

        history.remove_command(case, adapt).unwrap();
        assert!(history.graph().get(adapt).is_none());
        assert!(history.graph().get(hidden).is_none());
        assert!(history.graph().get(group).is_some());
        assert!(history
            .check_command(case, group)
            .unwrap()
            .contains(Validity::DEPENDENCY));
    }

    #[test]
    fn test_hidden_commands_are_not_directly_editable() {
        let (mut history, case, stage) = history();
        let adapt = history
            .add_command(case, stage, "MACR_ADAP_MAIL", None)
            .unwrap();
        history
            .set_keywords(
                case,
                adapt,
                vec![(
                    "MAILLAGE_NP1".to_string(),
                    KeywordValue::NewOutput("meshout".to_string()),
                )],
            )
            .unwrap();
        let hidden = history.scope(case, stage).unwrap().resolve("meshout").unwrap();
        assert!(matches!(
            history.rename_command(case, hidden, "other"),
            Err(ModelError::State(StateError::HiddenCommand { .. }))
        ));
        assert!(matches!(
            history.remove_command(case, hidden),
            Err(ModelError::State(StateError::HiddenCommand { .. }))
        ));
    }

    #[test]
    fn test_autocopy_clones_only_for_the_mutating_case() {
        let (mut history, case, stage) = history();
        let (mesh, _) = mesh_and_model(&mut history, case, stage);
        let run = history.create_run_case("run1", &[stage], &[stage]).unwrap();
        // Reusable stage is shared verbatim
        assert_eq!(history.case(run).unwrap().stage_ids(), &[stage]);

        history.set_autocopy(true);
        let renamed = history.rename_command(case, mesh, "grid").unwrap();
        assert_ne!(renamed, mesh, "autocopy remaps the mutated command");
        let current_stage = history.current_case().stage_ids()[0];
        assert_ne!(current_stage, stage, "current case got its own clone");
        // The run case still sees the original stage, untouched
        assert_eq!(history.case(run).unwrap().stage_ids(), &[stage]);
        assert_eq!(history.graph().get(mesh).unwrap().name(), "mesh");
        assert_eq!(history.graph().get(renamed).unwrap().name(), "grid");
    }

    #[test]
    fn test_shared_mutation_without_autocopy_broadcasts() {
        let (mut history, case, stage) = history();
        let (mesh, _) = mesh_and_model(&mut history, case, stage);
        let run = history.create_run_case("run1", &[stage], &[stage]).unwrap();
        let renamed = history.rename_command(case, mesh, "grid").unwrap();
        assert_eq!(renamed, mesh, "no clone outside an autocopy bracket");
        // Both cases observe the mutation through the shared stage
        assert_eq!(history.case(run).unwrap().stage_ids(), &[stage]);
        assert_eq!(history.graph().get(mesh).unwrap().name(), "grid");
    }

    #[test]
    fn test_run_case_clones_non_reusable_stages() {
        let (mut history, case, s1) = history();
        let (mesh, _) = mesh_and_model(&mut history, case, s1);
        let s2 = history.add_stage(case, "s2").unwrap();
        let group = history
            .add_command(case, s2, "DEFI_GROUP", Some("grp"))
            .unwrap();
        history
            .set_keywords(
                case,
                group,
                vec![("MAILLAGE".to_string(), KeywordValue::Ref(mesh))],
            )
            .unwrap();

        let run = history.create_run_case("run1", &[s2], &[s1]).unwrap();
        let run_case = history.case(run).unwrap();
        assert_eq!(run_case.stage_ids()[0], s1, "reusable stage shared");
        let s2_clone = run_case.stage_ids()[1];
        assert_ne!(s2_clone, s2, "executed stage cloned");
        assert!(run_case.is_intermediate(s2_clone));
        assert!(run_case.is_executed(s2_clone));
        assert!(!run_case.is_executed(s1));

        // The clone's command references the shared stage's original mesh
        let clone_cmd = history.stage(s2_clone).unwrap().command_ids()[0];
        assert_ne!(clone_cmd, group);
        assert!(history
            .graph()
            .get(clone_cmd)
            .unwrap()
            .parents()
            .contains(&mesh));
        assert_eq!(history.check_case(run).unwrap(), Validity::NOTHING);
    }

    #[test]
    fn test_case_delete_cascade_and_current_protection() {
        let (mut history, case, stage) = history();
        mesh_and_model(&mut history, case, stage);
        let copy1 = history.copy_case(case, "copy1").unwrap();
        let copy2 = history.copy_case(copy1, "copy2").unwrap();

        assert!(matches!(
            history.remove_case(case),
            Err(ModelError::State(StateError::CurrentCaseDelete { .. }))
        ));
        // Deleting copy1 takes the later sharer copy2 with it
        history.remove_case(copy1).unwrap();
        assert!(history.case(copy1).is_none());
        assert!(history.case(copy2).is_none());
        // Shared stage survives through the current case
        assert!(history.stage(stage).is_some());
    }

    #[test]
    fn test_case_delete_refuses_to_cascade_into_current() {
        let (mut history, case, stage) = history();
        mesh_and_model(&mut history, case, stage);
        let copy1 = history.copy_case(case, "copy1").unwrap();
        history.set_current_case(copy1).unwrap();
        assert!(matches!(
            history.remove_case(case),
            Err(ModelError::State(StateError::CascadeIntoCurrent { .. }))
        ));
        assert!(history.case(case).is_some());
        assert_eq!(history.current_case_id(), copy1);
        let _ = stage;
    }

    #[test]
    fn test_backup_and_restore() {
        let (mut history, case, stage) = history();
        mesh_and_model(&mut history, case, stage);
        let backup = history.create_backup_case("bak");
        assert_eq!(history.case(backup).unwrap().role(), CaseRole::Backup);

        let s2 = history.add_stage(case, "s2").unwrap();
        assert_eq!(history.current_case().stage_ids().len(), 2);
        history.restore_backup(backup).unwrap();
        assert_eq!(history.current_case().stage_ids(), &[stage]);
        // The dropped stage was referenced by no other case and is gone
        assert!(history.stage(s2).is_none());

        assert!(matches!(
            history.restore_backup(case),
            Err(ModelError::State(StateError::NotABackup { .. }))
        ));
    }

    #[test]
    fn test_repair_rebinds_broken_references() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        history.remove_command(case, mesh).unwrap();
        assert!(history
            .check_command(case, model)
            .unwrap()
            .contains(Validity::DEPENDENCY));

        let replacement = history
            .add_command(case, stage, "LIRE_MAILLAGE", Some("mesh"))
            .unwrap();
        let residual = history.repair_case(case).unwrap();
        assert_eq!(residual, Validity::NOTHING);
        assert!(history
            .graph()
            .get(model)
            .unwrap()
            .parents()
            .contains(&replacement));
        assert_eq!(history.check_command(case, model).unwrap(), Validity::NOTHING);
    }

    #[test]
    fn test_record_result_is_idempotent() {
        let (mut history, case, stage) = history();
        history
            .record_result(case, stage, RunStatus::Error, vec!["boom".to_string()])
            .unwrap();
        history
            .record_result(case, stage, RunStatus::Success, vec![])
            .unwrap();
        let record = history.case(case).unwrap().result(stage).unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert!(record.messages.is_empty());
    }

    #[test]
    fn test_sorted_commands_cached_per_revision() {
        let (mut history, case, stage) = history();
        let (mesh, model) = mesh_and_model(&mut history, case, stage);
        let first = history.sorted_commands(stage);
        assert_eq!(first, history.sorted_commands(stage));
        let extra = history
            .add_command(case, stage, "LIRE_MAILLAGE", Some("grid"))
            .unwrap();
        let second = history.sorted_commands(stage);
        assert!(second.contains(&extra));
        assert!(second.len() > first.len());
        let idx = |order: &Vec<NodeId>, id| order.iter().position(|&o| o == id).unwrap();
        assert!(idx(&second, mesh) < idx(&second, model));
    }
}
