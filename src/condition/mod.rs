// src/condition/mod.rs

//! Branch conditions attached to flow nodes.
//!
//! A condition is a small typed expression tree evaluated once per object
//! against the object's backing result document:
//!
//! ```json
//! { "kind": "joiner", "op": "and",
//!   "left":  { "kind": "comparison", "field": "score", "op": ">=", "value": 90 },
//!   "right": { "kind": "comparison", "field": "status", "op": "==", "value": "passed" } }
//! ```
//!
//! - [`eval`] resolves field paths and applies comparators.
//! - [`clauses`] folds the older flat clause-list format into a tree.

pub mod clauses;
pub mod eval;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{FlowError, Result};

pub use clauses::{Clause, from_clauses};

/// Expression tree routing an object to a node's true or false child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        /// Dotted path into the result document, e.g. `scores.current_average`.
        field: String,
        op: Comparator,
        value: Literal,
    },
    Joiner {
        left: Box<Condition>,
        op: JoinOp,
        right: Box<Condition>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    /// Regex match against the textual form of the field.
    #[serde(rename = "matches")]
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinOp {
    And,
    Or,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Literal {
    /// Convert a loosely typed JSON value; numeric strings become numbers.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Literal::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Literal::Number),
            serde_json::Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) => Some(Literal::Number(n)),
                Err(_) => Some(Literal::Text(s.clone())),
            },
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl Condition {
    pub fn comparison(field: impl Into<String>, op: Comparator, value: Literal) -> Self {
        Condition::Comparison {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn and(self, right: Condition) -> Self {
        Condition::Joiner {
            left: Box::new(self),
            op: JoinOp::And,
            right: Box::new(right),
        }
    }

    pub fn or(self, right: Condition) -> Self {
        Condition::Joiner {
            left: Box::new(self),
            op: JoinOp::Or,
            right: Box::new(right),
        }
    }

    /// Structural checks done when a flow graph is built: non-empty field
    /// paths and compilable `matches` patterns.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Comparison { field, op, value } => {
                if field.trim().is_empty() {
                    return Err(FlowError::InvalidCondition(
                        "comparison with empty field path".to_string(),
                    ));
                }
                if *op == Comparator::Matches {
                    let Literal::Text(pattern) = value else {
                        return Err(FlowError::InvalidCondition(format!(
                            "`matches` on '{field}' needs a string pattern"
                        )));
                    };
                    regex::Regex::new(pattern).map_err(|e| {
                        FlowError::InvalidCondition(format!("bad pattern for '{field}': {e}"))
                    })?;
                }
                Ok(())
            }
            Condition::Joiner { left, right, .. } => {
                left.validate()?;
                right.validate()
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Comparison { field, op, value } => {
                let op = match op {
                    Comparator::Eq => "==",
                    Comparator::Ne => "!=",
                    Comparator::Gt => ">",
                    Comparator::Ge => ">=",
                    Comparator::Lt => "<",
                    Comparator::Le => "<=",
                    Comparator::Matches => "matches",
                };
                write!(f, "{field} {op} {value}")
            }
            Condition::Joiner { left, op, right } => {
                let op = match op {
                    JoinOp::And => "and",
                    JoinOp::Or => "or",
                };
                write!(f, "({left} {op} {right})")
            }
        }
    }
}

/// Accept either a condition tree or a legacy clause list.
pub fn deserialize_lenient<'de, D>(deserializer: D) -> std::result::Result<Option<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Tree(Condition),
        Clauses(Vec<Clause>),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Tree(c)) => Ok(Some(c)),
        Some(Repr::Clauses(list)) if list.is_empty() => Ok(None),
        Some(Repr::Clauses(list)) => from_clauses(&list)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
