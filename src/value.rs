//! Keyword value types for the study model.
//!
//! A command's keyword values form a small tree: literals, references to
//! other commands, "create new output" markers, lists, and nested keyword
//! groups (facts). Keyword order is declaration order and is preserved,
//! which is why maps are `Vec` of pairs rather than `HashMap` - for macro
//! commands the declaration order of markers is the only ordering
//! guarantee their hidden outputs get.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::NodeId;

/// Ordered keyword -> value pairs of a command.
pub type Keywords = Vec<(String, KeywordValue)>;

/// One keyword value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeywordValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Textual reference that is not (or no longer) bound to a command.
    /// Produced by the parser boundary and by deletion of a referenced
    /// command; `repair()` re-resolves these by name.
    Name(String),
    /// Bound reference to another command. Rendering always goes through
    /// the graph to pick up the target's *current* name.
    Ref(NodeId),
    /// "Create new output" marker of a macro command, e.g. `CO('mesh2')`.
    NewOutput(String),
    List(Vec<KeywordValue>),
    /// Nested keyword group.
    Fact(Keywords),
}

impl KeywordValue {
    /// Collect every bound reference in the subtree, in declaration order.
    pub fn refs(&self, out: &mut Vec<NodeId>) {
        match self {
            KeywordValue::Ref(id) => out.push(*id),
            KeywordValue::List(items) => {
                for item in items {
                    item.refs(out);
                }
            }
            KeywordValue::Fact(pairs) => {
                for (_, value) in pairs {
                    value.refs(out);
                }
            }
            _ => {}
        }
    }

    /// Collect every unresolved textual reference in the subtree.
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            KeywordValue::Name(name) => out.push(name.clone()),
            KeywordValue::List(items) => {
                for item in items {
                    item.names(out);
                }
            }
            KeywordValue::Fact(pairs) => {
                for (_, value) in pairs {
                    value.names(out);
                }
            }
            _ => {}
        }
    }

    /// Rewrite the subtree with `f`, bottom-up. Used to break references
    /// on deletion (`Ref -> Name`) and to rebind them on repair.
    pub fn map(self, f: &mut impl FnMut(KeywordValue) -> KeywordValue) -> KeywordValue {
        let mapped = match self {
            KeywordValue::List(items) => {
                KeywordValue::List(items.into_iter().map(|v| v.map(&mut *f)).collect())
            }
            KeywordValue::Fact(pairs) => KeywordValue::Fact(
                pairs.into_iter().map(|(k, v)| (k, v.map(&mut *f))).collect(),
            ),
            leaf => leaf,
        };
        f(mapped)
    }

    /// Short kind label for diagnostics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            KeywordValue::Int(_) => "integer",
            KeywordValue::Float(_) => "float",
            KeywordValue::Str(_) => "text",
            KeywordValue::Name(_) => "reference",
            KeywordValue::Ref(_) => "reference",
            KeywordValue::NewOutput(_) => "new output",
            KeywordValue::List(_) => "list",
            KeywordValue::Fact(_) => "fact",
        }
    }
}

impl fmt::Display for KeywordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeywordValue::Int(i) => write!(f, "{}", i),
            KeywordValue::Float(n) => write!(f, "{}", n),
            KeywordValue::Str(s) => write!(f, "'{}'", s),
            KeywordValue::Name(n) => write!(f, "{}", n),
            KeywordValue::Ref(id) => write!(f, "<#{}>", id),
            KeywordValue::NewOutput(n) => write!(f, "CO('{}')", n),
            KeywordValue::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            KeywordValue::Fact(pairs) => {
                write!(f, "_F(")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", key, value)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Collect bound references across a whole keyword set.
pub fn keyword_refs(keywords: &Keywords) -> Vec<NodeId> {
    let mut out = Vec::new();
    for (_, value) in keywords {
        value.refs(&mut out);
    }
    out
}

/// Collect "new output" marker names across a keyword set, in declaration
/// order, paired with the top-level keyword that declared them.
pub fn keyword_markers(keywords: &Keywords) -> Vec<(String, String)> {
    fn walk(keyword: &str, value: &KeywordValue, out: &mut Vec<(String, String)>) {
        match value {
            KeywordValue::NewOutput(name) => out.push((keyword.to_string(), name.clone())),
            KeywordValue::List(items) => {
                for item in items {
                    walk(keyword, item, out);
                }
            }
            KeywordValue::Fact(pairs) => {
                for (inner, value) in pairs {
                    walk(inner, value, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for (keyword, value) in keywords {
        walk(keyword, value, &mut out);
    }
    out
}

/// Rewrite every value of a keyword set with `f`.
pub fn map_keywords(
    keywords: Keywords,
    f: &mut impl FnMut(KeywordValue) -> KeywordValue,
) -> Keywords {
    keywords
        .into_iter()
        .map(|(k, v)| (k, v.map(&mut *f)))
        .collect()
}
