//! Validity flags and the check/repair engine.
//!
//! Validity is data, not control flow: a study is allowed to exist in an
//! invalid state mid-edit, and `check()` reports that state instead of
//! refusing it. Flags are additive - a command can fail several checks
//! at once - and aggregate upward by bitwise OR from commands to stages
//! to cases.
//!
//! Propagation is lazy/pull: caches are tagged with the structural
//! revision (and case) they were computed at and recomputed on demand,
//! which is guaranteed to match a full recompute.

use bitflags::bitflags;
use std::cell::Cell;

use tracing::{debug, warn};

use crate::case::{Case, CaseId};
use crate::error::{CatalogViolation, ModelError};
use crate::graph::NodeId;
use crate::history::History;
use crate::node::NodeKind;
use crate::value::{map_keywords, KeywordValue};

bitflags! {
    /// OR-combinable validity state of a command, stage or case.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Validity: u8 {
        /// Terminal/initial good state.
        const NOTHING = 0;
        /// Fails catalog mandatory-keyword or typing rules (local check,
        /// independent of the graph).
        const SYNTAXIC = 1 << 0;
        /// References a command that is itself invalid, deleted and not
        /// repaired, or not visible in scope.
        const DEPENDENCY = 1 << 1;
        /// Name collides with a simultaneously visible command where
        /// neither depends on the other.
        const NAMING = 1 << 2;
    }
}

/// Per-node cache slot: (structural revision, case checked against,
/// computed flags).
#[derive(Debug, Clone, Default)]
pub(crate) struct ValidityCache(Cell<Option<(u64, CaseId, Validity)>>);

impl ValidityCache {
    fn lookup(&self, revision: u64, case: CaseId) -> Option<Validity> {
        match self.0.get() {
            Some((rev, c, flags)) if rev == revision && c == case => Some(flags),
            _ => None,
        }
    }

    fn store(&self, revision: u64, case: CaseId, flags: Validity) {
        self.0.set(Some((revision, case, flags)));
    }
}

/// Pull-based checker for one case.
pub(crate) struct Checker<'a> {
    pub(crate) history: &'a History,
    pub(crate) case: &'a Case,
}

impl Checker<'_> {
    /// Safe check: catalog violations become `SYNTAXIC` flags.
    pub(crate) fn command(&self, id: NodeId) -> Validity {
        self.command_inner(id, false)
            .unwrap_or(Validity::SYNTAXIC)
    }

    /// Strict check: the underlying catalog violation of *this* command
    /// propagates; parent validity is still computed safely.
    pub(crate) fn command_strict(&self, id: NodeId) -> Result<Validity, CatalogViolation> {
        self.command_inner(id, true)
    }

    fn command_inner(&self, id: NodeId, strict: bool) -> Result<Validity, CatalogViolation> {
        let revision = self.history.revision();
        let Some(node) = self.history.graph().get(id) else {
            return Ok(Validity::DEPENDENCY);
        };
        if !strict {
            if let Some(flags) = node.validity_cache.lookup(revision, self.case.id()) {
                return Ok(flags);
            }
        }

        let mut flags = Validity::NOTHING;
        match node.kind() {
            NodeKind::Comment { .. } => {
                return Ok(Validity::NOTHING);
            }
            NodeKind::Variable { expression } => {
                if expression.trim().is_empty() {
                    flags |= Validity::SYNTAXIC;
                }
            }
            NodeKind::Hidden { .. } => {}
            NodeKind::Command { title, keywords } => {
                match self.history.catalog().definition(title) {
                    None => {
                        let violation = CatalogViolation::UnknownTitle {
                            title: title.clone(),
                        };
                        if strict {
                            return Err(violation);
                        }
                        flags |= Validity::SYNTAXIC;
                    }
                    Some(def) => {
                        let history = self.history;
                        let resolve_type = |target: NodeId| history.produced_type(target);
                        if let Err(violation) = def.check(keywords, &resolve_type) {
                            if strict {
                                return Err(violation);
                            }
                            flags |= Validity::SYNTAXIC;
                        }
                    }
                }
                flags |= self.reference_flags(id, keywords);
            }
        }

        // A broken or invalid parent poisons the dependent.
        let own_pos = self.stage_position(id);
        for &parent in node.parents() {
            match (own_pos, self.stage_position(parent)) {
                (Some(own), Some(theirs)) if theirs <= own => {
                    if self.command(parent) != Validity::NOTHING {
                        flags |= Validity::DEPENDENCY;
                        break;
                    }
                }
                _ => {
                    flags |= Validity::DEPENDENCY;
                    break;
                }
            }
        }

        // Simultaneously visible duplicate names with no dependency
        // relation between them.
        if node.is_named() {
            if let Some(scope) = self.scope_of(id) {
                if !scope.naming_conflicts(id).is_empty() {
                    flags |= Validity::NAMING;
                }
            }
        }

        if !strict {
            node.validity_cache.store(revision, self.case.id(), flags);
        }
        Ok(flags)
    }

    /// Dependency flags contributed by the keyword values themselves:
    /// unresolved names and references outside the visible scope.
    fn reference_flags(&self, id: NodeId, keywords: &crate::value::Keywords) -> Validity {
        let own_pos = self.stage_position(id);
        let mut names = Vec::new();
        let mut refs = Vec::new();
        for (_, value) in keywords {
            value.names(&mut names);
            value.refs(&mut refs);
        }
        if !names.is_empty() {
            return Validity::DEPENDENCY;
        }
        for target in refs {
            if !self.history.graph().contains(target) {
                return Validity::DEPENDENCY;
            }
            match (own_pos, self.stage_position(target)) {
                (Some(own), Some(theirs)) if theirs <= own => {}
                _ => return Validity::DEPENDENCY,
            }
        }
        Validity::NOTHING
    }

    /// Position of a node's stage within this case, `None` when the
    /// node's stage is not part of the case.
    fn stage_position(&self, id: NodeId) -> Option<usize> {
        let stage = self.history.stage_of(id)?;
        self.case.stage_ids.iter().position(|&s| s == stage)
    }

    fn scope_of(&self, id: NodeId) -> Option<crate::naming::Scope<'_>> {
        let stage = self.history.stage_of(id)?;
        self.history.scope_in(self.case, stage)
    }

    pub(crate) fn stage(&self, stage: crate::stage::StageId) -> Validity {
        let Some(stage) = self.history.stage(stage) else {
            return Validity::NOTHING;
        };
        let mut flags = Validity::NOTHING;
        for &id in stage.command_ids() {
            flags |= self.command(id);
        }
        flags
    }

    pub(crate) fn case(&self) -> Validity {
        let mut flags = Validity::NOTHING;
        for &stage in &self.case.stage_ids {
            flags |= self.stage(stage);
        }
        flags
    }
}

/// Attempt automatic recovery of `DEPENDENCY` errors in `case` by
/// re-resolving each broken textual reference against currently-visible
/// commands (nearest match wins).
///
/// Deleters are repaired last so a reference broken by deleting its
/// target is not rebound to a same-named command the deleter is about to
/// release as well. Returns the residual case validity; `SYNTAXIC` and
/// unrepairable `NAMING` conflicts are untouched.
pub(crate) fn repair(history: &mut History, case_id: CaseId) -> Result<Validity, ModelError> {
    let case = history.require_case(case_id)?.clone();

    // (command, stage) worklist: stage by stage in dependency order,
    // deleters last within the whole case.
    let mut ordinary = Vec::new();
    let mut deleters = Vec::new();
    for &stage_id in &case.stage_ids {
        for id in history.sorted_commands(stage_id) {
            let is_deleter = history
                .graph()
                .get(id)
                .and_then(|n| n.title())
                .map(|t| {
                    history.catalog().kind_of(t) == crate::catalog::DefinitionKind::Deleter
                })
                .unwrap_or(false);
            if is_deleter {
                deleters.push(id);
            } else {
                ordinary.push(id);
            }
        }
    }

    for id in ordinary.into_iter().chain(deleters) {
        repair_command(history, &case, id);
    }
    history.bump_revision();
    Ok(history.check_case(case_id)?)
}

fn repair_command(history: &mut History, case: &Case, id: NodeId) {
    let Some(node) = history.graph().get(id) else {
        return;
    };
    let Some(keywords) = node.keywords() else {
        return;
    };
    let mut broken = Vec::new();
    for (_, value) in keywords {
        value.names(&mut broken);
    }
    if broken.is_empty() {
        return;
    }
    let Some(stage) = history.stage_of(id) else {
        return;
    };

    let mut bindings: Vec<(String, NodeId)> = Vec::new();
    {
        let Some(scope) = history.scope_in(case, stage) else {
            return;
        };
        for name in &broken {
            if let Ok(target) = scope.resolve_excluding(name, id) {
                bindings.push((name.clone(), target));
            }
        }
    }

    for (name, target) in bindings {
        if let Err(err) = history.graph_mut().add_edge(target, id) {
            warn!(command = %id, name = %name, "repair skipped: {}", err);
            continue;
        }
        let node = history
            .graph_mut()
            .get_mut(id)
            .expect("repair target exists");
        if let NodeKind::Command { keywords, .. } = &mut node.kind {
            let owned = std::mem::take(keywords);
            *keywords = map_keywords(owned, &mut |value| match value {
                KeywordValue::Name(n) if n == name => KeywordValue::Ref(target),
                other => other,
            });
        }
        debug!(command = %id, name = %name, target = %target, "repaired reference");
    }
}
