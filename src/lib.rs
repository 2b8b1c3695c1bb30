//! study-model - dependency-aware data model for solver command studies.
//!
//! This crate models a study as ordered command stages within cases: a
//! mutable dependency DAG of solver commands that stays topologically
//! consistent under insertion, deletion and renaming, and reports
//! fine-grained validity (syntax, naming conflicts, broken dependencies)
//! from commands up through stages and cases.
//!
//! The GUI, the command-text parser/renderer, persistence encodings and
//! the execution runner are external collaborators; the model exposes
//! the boundary shapes they need (`CommandSpec` sequences, serde
//! serialization, `RunnerSnapshot`) and nothing more. The command
//! catalog is injected at construction.
//!
//! ## Quick start
//!
//! ```
//! use study_model::{Catalog, CommandDefinition, History, KeywordSpec, KeywordValue, ValueKind};
//!
//! let mut catalog = Catalog::new("demo");
//! catalog.insert(CommandDefinition::operator("LIRE_MAILLAGE", 1, Some("maillage")));
//! catalog.insert(
//!     CommandDefinition::operator("AFFE_MODELE", 2, Some("modele"))
//!         .keyword(KeywordSpec::new("MAILLAGE", ValueKind::Reference).of("maillage").required()),
//! );
//!
//! let mut history = History::new(catalog);
//! let case = history.current_case_id();
//! let stage = history.add_stage(case, "s1").unwrap();
//! let mesh = history.add_command(case, stage, "LIRE_MAILLAGE", Some("mesh")).unwrap();
//! let model = history.add_command(case, stage, "AFFE_MODELE", Some("model")).unwrap();
//! history
//!     .set_keywords(case, model, vec![("MAILLAGE".to_string(), KeywordValue::Ref(mesh))])
//!     .unwrap();
//! assert!(history.check_case(case).unwrap().is_empty());
//! ```

// Core error handling
pub mod error;

// Injected command catalog
pub mod catalog;

// Keyword value tree
pub mod value;

// Entity graph and node kinds
pub mod graph;
pub mod node;

// Name resolution across ordered scopes
pub mod naming;

// Dependency-aware ordering
pub mod order;

// Validity flags, checking, repair
pub mod validity;

// Macro hidden-output expansion
mod expansion;

// Containment hierarchy
pub mod case;
pub mod history;
pub mod stage;

// Boundary surfaces
pub mod exchange;
pub mod runner;

pub use case::{Case, CaseId, CaseRole, ResultRecord, RunStatus};
pub use catalog::{
    Catalog, CommandDefinition, DefinitionKind, KeywordSpec, TypeTag, ValueKind,
};
pub use error::{
    CatalogViolation, ConversionError, CycleError, ModelError, ResolveError, StateError,
    StructuralError,
};
pub use exchange::{CommandParser, CommandRenderer, CommandSpec, COMMENT_TITLE, VARIABLE_TITLE};
pub use graph::{EntityGraph, NodeId};
pub use history::History;
pub use naming::{validate_name, Scope, NAME_LIMIT};
pub use node::{Node, NodeKind};
pub use runner::{CommandLine, RunnerSnapshot, StageSnapshot};
pub use stage::{FileBinding, FileDirection, Stage, StageId, StageMode};
pub use validity::Validity;
pub use value::{KeywordValue, Keywords};
