//! Name resolution across ordered scopes.
//!
//! A stage sees its own commands plus all commands of the preceding
//! stages in the same case. Within one stage, "last by dependency order
//! wins": legal duplicate names only arise when a later command reuses
//! the name of one it depends on, and the reusing command shadows it.
//! Resolution is always live - there is no separate name index to keep
//! in sync with renames.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ResolveError, StateError};
use crate::graph::{EntityGraph, NodeId};

/// Solver identifiers: leading ASCII letter, then letters, digits or
/// underscore, at most eight characters.
pub const NAME_LIMIT: usize = 8;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid pattern"))
}

/// Check a user-supplied result name against the identifier rules.
pub fn validate_name(name: &str) -> Result<(), StateError> {
    if name.len() > NAME_LIMIT {
        return Err(StateError::InvalidName {
            name: name.to_string(),
            reason: format!("longer than {} characters", NAME_LIMIT),
        });
    }
    if !name_pattern().is_match(name) {
        return Err(StateError::InvalidName {
            name: name.to_string(),
            reason: "must start with a letter and contain only letters, digits or '_'"
                .to_string(),
        });
    }
    Ok(())
}

/// Visibility scope of one stage within one case.
///
/// `chain` holds the commands visible from the scope stage, nearest
/// first: the scope stage's own commands (in dependency order), then
/// each preceding stage's, from nearest to farthest.
pub struct Scope<'a> {
    graph: &'a EntityGraph,
    chain: Vec<Vec<NodeId>>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(graph: &'a EntityGraph, chain: Vec<Vec<NodeId>>) -> Self {
        Scope { graph, chain }
    }

    /// Every visible match for `name`, most recent first.
    fn matches(&self, name: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        for stage in &self.chain {
            for &id in stage.iter().rev() {
                let hit = self
                    .graph
                    .get(id)
                    .map(|n| n.is_named() && n.name() == name)
                    .unwrap_or(false);
                if hit {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Most recent visible command with this name.
    pub fn resolve(&self, name: &str) -> Result<NodeId, ResolveError> {
        self.matches(name)
            .first()
            .copied()
            .ok_or_else(|| self.not_found(name))
    }

    /// The `index`-th (0-based) match counting from the most recent
    /// backward - `stage[name:N]` semantics.
    pub fn resolve_indexed(&self, name: &str, index: usize) -> Result<NodeId, ResolveError> {
        let matches = self.matches(name);
        if matches.is_empty() {
            return Err(self.not_found(name));
        }
        matches
            .get(index)
            .copied()
            .ok_or_else(|| ResolveError::IndexOutOfRange {
                name: name.to_string(),
                index,
                available: matches.len(),
            })
    }

    /// Most recent visible match that does not (transitively) depend on
    /// `excluded` - "the version of this name before a given edit."
    pub fn resolve_excluding(
        &self,
        name: &str,
        excluded: NodeId,
    ) -> Result<NodeId, ResolveError> {
        self.matches(name)
            .into_iter()
            .find(|&id| id != excluded && !self.graph.has_path(excluded, id))
            .ok_or_else(|| self.not_found(name))
    }

    /// Existence check without resolution.
    pub fn exists(&self, name: &str) -> bool {
        !self.matches(name).is_empty()
    }

    /// Visible nodes (other than `of`) carrying the same name as `of`
    /// with no dependency relation to it in either direction - a naming
    /// conflict, reported as a validity flag by the checker.
    pub(crate) fn naming_conflicts(&self, of: NodeId) -> Vec<NodeId> {
        let Some(node) = self.graph.get(of) else {
            return Vec::new();
        };
        if !node.is_named() {
            return Vec::new();
        }
        self.matches(node.name())
            .into_iter()
            .filter(|&other| {
                other != of
                    && !self.graph.has_path(of, other)
                    && !self.graph.has_path(other, of)
            })
            .collect()
    }

    fn not_found(&self, name: &str) -> ResolveError {
        ResolveError::NotFound {
            name: name.to_string(),
            suggestions: self.suggestions(name),
        }
    }

    /// Closest visible names by Jaro-Winkler similarity, best first.
    fn suggestions(&self, name: &str) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = Vec::new();
        for stage in &self.chain {
            for &id in stage {
                let Some(node) = self.graph.get(id) else {
                    continue;
                };
                if !node.is_named() {
                    continue;
                }
                let score = strsim::jaro_winkler(name, node.name());
                if score >= 0.85 && !scored.iter().any(|(_, n)| n == node.name()) {
                    scored.push((score, node.name().to_string()));
                }
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(3).map(|(_, n)| n).collect()
    }
}

/// Derive a default command name from its title: lowercased first word,
/// clipped to the identifier limit, numeric suffix on collision.
pub(crate) fn auto_name(title: &str, taken: &dyn Fn(&str) -> bool) -> String {
    let base: String = title
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase();
    let base = if base.is_empty() || !base.starts_with(|c: char| c.is_ascii_alphabetic()) {
        format!("r{}", base)
    } else {
        base
    };
    let base: String = base.chars().take(NAME_LIMIT).collect();
    if !taken(&base) {
        return base;
    }
    for n in 0u32.. {
        let suffix = n.to_string();
        let keep = NAME_LIMIT.saturating_sub(suffix.len());
        let candidate: String = base.chars().take(keep).chain(suffix.chars()).collect();
        if !taken(&candidate) {
            return candidate;
        }
    }
    unreachable!("suffix search is unbounded")
}
