//! Error handling for the study data model
//!
//! This module provides idiomatic Rust error types using thiserror for
//! better error messages and proper error chain handling.
//!
//! Structural and lifecycle misuse is an error; *invalidity* is not.
//! A study is allowed to exist in an invalid state mid-edit, so syntax,
//! dependency, and naming problems are reported as [`crate::Validity`]
//! flags from `check()`, never thrown from it.

use thiserror::Error;

use crate::graph::NodeId;

/// Main error type for the study model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Catalog violation: {0}")]
    Catalog(#[from] CatalogViolation),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Illegal graph operation. Always a programming-contract violation in
/// the caller; never recovered automatically.
#[derive(Error, Debug)]
pub enum StructuralError {
    #[error("node {id} is already owned by a graph")]
    AlreadyOwned { id: NodeId },

    #[error("no node with id {id}")]
    UnknownNode { id: NodeId },

    #[error("node {id} is not a {expected}")]
    WrongKind { id: NodeId, expected: String },

    #[error("no stage with id {id}")]
    UnknownStage { id: String },

    #[error("stage '{stage}' does not belong to case '{case}'")]
    StageNotInCase { stage: String, case: String },

    #[error("no case with id {id}")]
    UnknownCase { id: String },
}

/// An edge addition would create a cycle in the dependency relation.
/// Raised synchronously at the offending `add_edge`; the graph is left
/// exactly as it was before the call.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("adding edge {parent} -> {child} would create a cyclic dependency")]
    WouldCycle { parent: NodeId, child: NodeId },
}

/// Name resolution failed. Callers that can fall back to "no value"
/// should do so; parse-time resolution surfaces this as a user message.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("'{name}' is not defined{}", format_suggestions(.suggestions))]
    NotFound {
        name: String,
        /// Closest visible names, best first.
        suggestions: Vec<String>,
    },

    #[error("'{name}' has only {available} visible definition(s), index {index} requested")]
    IndexOutOfRange {
        name: String,
        index: usize,
        available: usize,
    },
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

/// Illegal lifecycle transition.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("case '{name}' is the current case and cannot be deleted")]
    CurrentCaseDelete { name: String },

    #[error("deleting case '{name}' would orphan the current case")]
    CascadeIntoCurrent { name: String },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("name '{name}' is reserved")]
    ReservedName { name: String },

    #[error("case '{case}' already has a stage named '{name}'")]
    DuplicateStageName { case: String, name: String },

    #[error("case '{name}' is not a backup case")]
    NotABackup { name: String },

    #[error("stage '{name}' is in text mode; graphical operation not available")]
    TextModeStage { name: String },

    #[error("stage '{name}' is in graphical mode; text operation not available")]
    GraphicalModeStage { name: String },

    #[error("hidden command '{name}' belongs to its macro and cannot be {operation} directly")]
    HiddenCommand { name: String, operation: String },
}

/// Mandatory-keyword or typing rule failure reported by the catalog.
///
/// Converted to the `SYNTAXIC` validity flag by the safe `check()` path;
/// propagated as-is by `check_strict()` for diagnostic tooling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogViolation {
    #[error("'{title}' is not a known command type")]
    UnknownTitle { title: String },

    #[error("'{title}' requires keyword '{keyword}'")]
    MissingKeyword { title: String, keyword: String },

    #[error("'{title}' does not accept keyword '{keyword}'")]
    UnknownKeyword { title: String, keyword: String },

    #[error("keyword '{keyword}' of '{title}' expects {expected}, got {got}")]
    WrongValueKind {
        title: String,
        keyword: String,
        expected: String,
        got: String,
    },

    #[error("keyword '{keyword}' of '{title}' expects a result of type '{expected}', '{target}' produces '{got}'")]
    WrongReferenceType {
        title: String,
        keyword: String,
        expected: String,
        target: String,
        got: String,
    },
}

/// Stage mode conversion failure. The stage is left untouched.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("stage '{name}' is already in text mode")]
    AlreadyText { name: String },

    #[error("stage '{name}' is already in graphical mode")]
    AlreadyGraphical { name: String },

    #[error("external parser rejected the stage text: {message}")]
    ParseFailed { message: String },
}
