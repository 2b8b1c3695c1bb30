//! Command catalog - the external definition of what each command type
//! supports.
//!
//! The catalog is an explicit immutable value injected into the model at
//! construction time (never ambient global state). It answers three
//! questions for a command title: which keywords are legal and mandatory,
//! which category ordinal orders it by default, and what result type a
//! command produces. Catalogs are buildable in code and deserializable
//! from YAML, one definition per command type.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CatalogViolation;
use crate::graph::NodeId;
use crate::value::{KeywordValue, Keywords};

/// Result type tag produced by a command, e.g. `maillage` or `modele`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag(pub String);

impl TypeTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What role a command type plays in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    /// Ordinary operator producing at most one result.
    #[default]
    Operator,
    /// Macro command - may declare additional named outputs inline.
    Macro,
    /// Initialization command, always ordered first in its stage.
    Starter,
    /// Marks names as destroyed; ordered after every prior user of the
    /// released names.
    Deleter,
}

/// Accepted shape of a keyword value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Any,
    Int,
    Float,
    Text,
    /// Reference to another command's result.
    Reference,
    /// "Create new output" marker (macros only).
    Output,
    /// Nested keyword group.
    Fact,
}

/// Specification of a single keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub value: ValueKind,
    /// Expected result type for `Reference` values; assigned type for
    /// `Output` markers declared under this keyword.
    #[serde(default)]
    pub of: Option<TypeTag>,
    /// Accept a list of conforming values.
    #[serde(default)]
    pub many: bool,
    /// Nested specs for `Fact` groups.
    #[serde(default)]
    pub keywords: Vec<KeywordSpec>,
}

impl KeywordSpec {
    pub fn new(name: &str, value: ValueKind) -> Self {
        KeywordSpec {
            name: name.to_string(),
            required: false,
            value,
            of: None,
            many: false,
            keywords: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn of(mut self, tag: &str) -> Self {
        self.of = Some(TypeTag(tag.to_string()));
        self
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }
}

/// Definition of one command type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub title: String,
    /// Category ordinal used as default ordering between commands with no
    /// dependency relation (lower sorts earlier).
    pub category: u16,
    #[serde(default)]
    pub kind: DefinitionKind,
    /// Result type of the command itself, when it produces one.
    #[serde(default)]
    pub result: Option<TypeTag>,
    #[serde(default)]
    pub keywords: Vec<KeywordSpec>,
}

impl CommandDefinition {
    pub fn operator(title: &str, category: u16, result: Option<&str>) -> Self {
        CommandDefinition {
            title: title.to_string(),
            category,
            kind: DefinitionKind::Operator,
            result: result.map(|t| TypeTag(t.to_string())),
            keywords: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: DefinitionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn keyword(mut self, spec: KeywordSpec) -> Self {
        self.keywords.push(spec);
        self
    }

    /// Result type for this command given its keyword values.
    ///
    /// Catalog results may depend on which branch of conditional keywords
    /// is populated, so this takes the values even though most operator
    /// definitions ignore them.
    pub fn produced_type(&self, _keywords: &Keywords) -> Option<TypeTag> {
        self.result.clone()
    }

    /// Assigned type for outputs declared under `keyword`, if the spec
    /// types them. Untyped markers stay untyped until context types them.
    pub fn output_type(&self, keyword: &str) -> Option<TypeTag> {
        fn find<'a>(specs: &'a [KeywordSpec], keyword: &str) -> Option<&'a KeywordSpec> {
            for spec in specs {
                if spec.name == keyword && spec.value == ValueKind::Output {
                    return Some(spec);
                }
                if let Some(found) = find(&spec.keywords, keyword) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.keywords, keyword).and_then(|s| s.of.clone())
    }

    /// Enforce the mandatory-keyword and typing rules on a keyword set.
    ///
    /// `resolve_type` maps a bound reference to the type its target
    /// produces (`None` when unknown); unknown types are never an error.
    pub fn check(
        &self,
        keywords: &Keywords,
        resolve_type: &dyn Fn(NodeId) -> Option<TypeTag>,
    ) -> Result<(), CatalogViolation> {
        self.check_group(&self.keywords, keywords, resolve_type)
    }

    fn check_group(
        &self,
        specs: &[KeywordSpec],
        keywords: &Keywords,
        resolve_type: &dyn Fn(NodeId) -> Option<TypeTag>,
    ) -> Result<(), CatalogViolation> {
        for spec in specs {
            if spec.required && !keywords.iter().any(|(k, _)| k == &spec.name) {
                return Err(CatalogViolation::MissingKeyword {
                    title: self.title.clone(),
                    keyword: spec.name.clone(),
                });
            }
        }
        for (keyword, value) in keywords {
            let spec = specs.iter().find(|s| &s.name == keyword).ok_or_else(|| {
                CatalogViolation::UnknownKeyword {
                    title: self.title.clone(),
                    keyword: keyword.clone(),
                }
            })?;
            self.check_value(spec, value, resolve_type)?;
        }
        Ok(())
    }

    fn check_value(
        &self,
        spec: &KeywordSpec,
        value: &KeywordValue,
        resolve_type: &dyn Fn(NodeId) -> Option<TypeTag>,
    ) -> Result<(), CatalogViolation> {
        if spec.many {
            if let KeywordValue::List(items) = value {
                for item in items {
                    self.check_single(spec, item, resolve_type)?;
                }
                return Ok(());
            }
        }
        self.check_single(spec, value, resolve_type)
    }

    fn check_single(
        &self,
        spec: &KeywordSpec,
        value: &KeywordValue,
        resolve_type: &dyn Fn(NodeId) -> Option<TypeTag>,
    ) -> Result<(), CatalogViolation> {
        let mismatch = |expected: &str| CatalogViolation::WrongValueKind {
            title: self.title.clone(),
            keyword: spec.name.clone(),
            expected: expected.to_string(),
            got: value.kind_label().to_string(),
        };
        match spec.value {
            ValueKind::Any => Ok(()),
            ValueKind::Int => match value {
                KeywordValue::Int(_) => Ok(()),
                _ => Err(mismatch("integer")),
            },
            ValueKind::Float => match value {
                KeywordValue::Int(_) | KeywordValue::Float(_) => Ok(()),
                _ => Err(mismatch("float")),
            },
            ValueKind::Text => match value {
                KeywordValue::Str(_) => Ok(()),
                _ => Err(mismatch("text")),
            },
            ValueKind::Reference => match value {
                // Unresolved names are a dependency problem, not a syntax one.
                KeywordValue::Name(_) => Ok(()),
                KeywordValue::Ref(id) => {
                    if let (Some(expected), Some(got)) = (&spec.of, resolve_type(*id)) {
                        if expected != &got {
                            return Err(CatalogViolation::WrongReferenceType {
                                title: self.title.clone(),
                                keyword: spec.name.clone(),
                                expected: expected.as_str().to_string(),
                                target: format!("#{}", id),
                                got: got.as_str().to_string(),
                            });
                        }
                    }
                    Ok(())
                }
                _ => Err(mismatch("reference")),
            },
            ValueKind::Output => match value {
                KeywordValue::NewOutput(_) => Ok(()),
                _ => Err(mismatch("new output")),
            },
            ValueKind::Fact => match value {
                KeywordValue::Fact(inner) => self.check_group(&spec.keywords, inner, resolve_type),
                _ => Err(mismatch("fact")),
            },
        }
    }
}

/// Immutable command catalog, keyed by title.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "CatalogFile", into = "CatalogFile")]
pub struct Catalog {
    version: String,
    definitions: HashMap<String, CommandDefinition>,
}

/// On-disk shape: a version string plus a flat list of definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    version: String,
    commands: Vec<CommandDefinition>,
}

impl From<CatalogFile> for Catalog {
    fn from(file: CatalogFile) -> Self {
        let mut definitions = HashMap::new();
        for def in file.commands {
            definitions.insert(def.title.clone(), def);
        }
        Catalog {
            version: file.version,
            definitions,
        }
    }
}

impl From<Catalog> for CatalogFile {
    fn from(catalog: Catalog) -> Self {
        let mut commands: Vec<_> = catalog.definitions.into_values().collect();
        commands.sort_by(|a, b| a.title.cmp(&b.title));
        CatalogFile {
            version: catalog.version,
            commands,
        }
    }
}

impl Catalog {
    pub fn new(version: &str) -> Self {
        Catalog {
            version: version.to_string(),
            definitions: HashMap::new(),
        }
    }

    /// Parse a catalog from its YAML form.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        Ok(file.into())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn insert(&mut self, definition: CommandDefinition) {
        self.definitions.insert(definition.title.clone(), definition);
    }

    /// Definition lookup; `None` for unknown titles.
    pub fn definition(&self, title: &str) -> Option<&CommandDefinition> {
        self.definitions.get(title)
    }

    pub fn kind_of(&self, title: &str) -> DefinitionKind {
        self.definition(title)
            .map(|d| d.kind)
            .unwrap_or(DefinitionKind::Operator)
    }

    /// Category ordinal for a title; unknown titles sort last.
    pub fn category_of(&self, title: &str) -> u16 {
        self.definition(title).map(|d| d.category).unwrap_or(u16::MAX)
    }
}
