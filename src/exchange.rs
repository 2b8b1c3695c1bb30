//! Parser/renderer boundary.
//!
//! The external text parser and renderer are collaborators, not part of
//! this crate: the model trades in ordered `CommandSpec` sequences. A
//! stage can be bulk-populated from specs (references arrive as textual
//! names and are resolved live against the visible scope) and extracted
//! back to specs (bound references render as the target's *current*
//! name). Extracting what was just populated yields the same shape.

use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, ModelError, StructuralError};
use crate::case::CaseId;
use crate::graph::NodeId;
use crate::history::History;
use crate::node::NodeKind;
use crate::stage::{StageId, StageMode};
use crate::value::{map_keywords, KeywordValue, Keywords};

/// Reserved spec title carrying a variable definition; the expression
/// travels in the `EXPR` keyword.
pub const VARIABLE_TITLE: &str = "_VARIABLE";
/// Reserved spec title carrying a comment; the text travels in the
/// `TEXT` keyword.
pub const COMMENT_TITLE: &str = "_COMMENT";

/// One command as seen by the parser/renderer boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub title: String,
    /// Result name; empty for unnamed (procedure) commands.
    pub name: String,
    pub keywords: Keywords,
}

impl CommandSpec {
    pub fn new(title: &str, name: &str, keywords: Keywords) -> Self {
        CommandSpec {
            title: title.to_string(),
            name: name.to_string(),
            keywords,
        }
    }
}

/// External command-text parser seam.
pub trait CommandParser {
    fn parse(&self, text: &str) -> Result<Vec<CommandSpec>, String>;
}

/// External command-text renderer seam.
pub trait CommandRenderer {
    fn render(&self, specs: &[CommandSpec]) -> String;
}

impl History {
    /// Bulk-populate a stage from boundary specs, in order. Textual
    /// references resolve against the commands visible at their point of
    /// insertion; what stays unresolved is kept as a name and surfaces
    /// as a `DEPENDENCY` flag, never an error.
    pub fn populate_stage(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        specs: &[CommandSpec],
    ) -> Result<Vec<NodeId>, ModelError> {
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = match spec.title.as_str() {
                COMMENT_TITLE => {
                    let text = first_text(&spec.keywords, "TEXT");
                    self.add_comment(case_id, stage_id, &text)?
                }
                VARIABLE_TITLE => {
                    let expression = first_text(&spec.keywords, "EXPR");
                    self.add_variable(case_id, stage_id, &spec.name, &expression)?
                }
                title => {
                    let name = if spec.name.is_empty() {
                        None
                    } else {
                        Some(spec.name.as_str())
                    };
                    let id = self.add_command(case_id, stage_id, title, name)?;
                    let resolved = {
                        let case = self.require_case(case_id)?;
                        let scope = self
                            .scope_in(case, stage_id)
                            .expect("stage prepared above");
                        map_keywords(spec.keywords.clone(), &mut |value| match value {
                            KeywordValue::Name(name) => match scope.resolve_excluding(&name, id) {
                                Ok(target) => KeywordValue::Ref(target),
                                Err(_) => KeywordValue::Name(name),
                            },
                            other => other,
                        })
                    };
                    self.set_keywords(case_id, id, resolved)?
                }
            };
            created.push(id);
        }
        Ok(created)
    }

    /// Extract a stage as boundary specs in insertion order. Hidden
    /// commands are implicit (the parser recreates them from their
    /// markers) and do not appear.
    pub fn extract_stage(&self, stage_id: StageId) -> Result<Vec<CommandSpec>, ModelError> {
        let stage = self
            .stage(stage_id)
            .ok_or(StructuralError::UnknownStage {
                id: stage_id.to_string(),
            })?;
        let mut specs = Vec::new();
        for &id in stage.command_ids() {
            let Some(node) = self.graph().get(id) else {
                continue;
            };
            match node.kind() {
                NodeKind::Hidden { .. } => {}
                NodeKind::Comment { text } => {
                    specs.push(CommandSpec::new(
                        COMMENT_TITLE,
                        "",
                        vec![("TEXT".to_string(), KeywordValue::Str(text.clone()))],
                    ));
                }
                NodeKind::Variable { expression } => {
                    specs.push(CommandSpec::new(
                        VARIABLE_TITLE,
                        node.name(),
                        vec![("EXPR".to_string(), KeywordValue::Str(expression.clone()))],
                    ));
                }
                NodeKind::Command { title, keywords } => {
                    let keywords = map_keywords(keywords.clone(), &mut |value| match value {
                        KeywordValue::Ref(target) => match self.graph().get(target) {
                            Some(node) => KeywordValue::Name(node.name().to_string()),
                            None => KeywordValue::Ref(target),
                        },
                        other => other,
                    });
                    specs.push(CommandSpec::new(title, node.name(), keywords));
                }
            }
        }
        Ok(specs)
    }

    /// Convert a graphical stage to text mode through the external
    /// renderer. The structured commands are destroyed only after the
    /// renderer produced the text.
    pub fn stage_to_text(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        renderer: &dyn CommandRenderer,
    ) -> Result<StageId, ModelError> {
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let stage = self.stage(stage_id).expect("prepared stage exists");
        if stage.is_text() {
            return Err(ConversionError::AlreadyText {
                name: stage.name().to_string(),
            }
            .into());
        }
        let specs = self.extract_stage(stage_id)?;
        let text = renderer.render(&specs);
        self.clear_stage_commands(stage_id);
        if let Some(stage) = self.stage_mut(stage_id) {
            stage.mode = StageMode::Text(text);
        }
        self.bump_revision();
        Ok(stage_id)
    }

    /// Convert a text stage back to graphical mode through the external
    /// parser. All specs apply or the stage is left in text mode,
    /// untouched.
    pub fn stage_to_graphical(
        &mut self,
        case_id: CaseId,
        stage_id: StageId,
        parser: &dyn CommandParser,
    ) -> Result<StageId, ModelError> {
        let (stage_id, _) = self.prepare_stage(case_id, stage_id)?;
        let text = match self.stage(stage_id).map(|s| s.mode().clone()) {
            Some(StageMode::Text(text)) => text,
            Some(StageMode::Graphical) => {
                return Err(ConversionError::AlreadyGraphical {
                    name: self
                        .stage(stage_id)
                        .map(|s| s.name().to_string())
                        .unwrap_or_default(),
                }
                .into())
            }
            None => {
                return Err(StructuralError::UnknownStage {
                    id: stage_id.to_string(),
                }
                .into())
            }
        };
        let specs = parser
            .parse(&text)
            .map_err(|message| ConversionError::ParseFailed { message })?;
        if let Some(stage) = self.stage_mut(stage_id) {
            stage.mode = StageMode::Graphical;
        }
        match self.populate_stage(case_id, stage_id, &specs) {
            Ok(_) => {
                self.bump_revision();
                Ok(stage_id)
            }
            Err(err) => {
                self.clear_stage_commands(stage_id);
                if let Some(stage) = self.stage_mut(stage_id) {
                    stage.mode = StageMode::Text(text);
                }
                self.bump_revision();
                Err(err)
            }
        }
    }

    fn clear_stage_commands(&mut self, stage_id: StageId) {
        while let Some(&id) = self
            .stage(stage_id)
            .and_then(|s| s.command_ids().first())
        {
            self.delete_node_cascade(id);
        }
    }
}

fn first_text(keywords: &Keywords, keyword: &str) -> String {
    keywords
        .iter()
        .find(|(k, _)| k == keyword)
        .and_then(|(_, v)| match v {
            KeywordValue::Str(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
