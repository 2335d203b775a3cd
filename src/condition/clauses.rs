// src/condition/clauses.rs

//! Legacy flat clause lists.
//!
//! Older automations store conditions as a flat list of clauses, each
//! carrying the joiner that connects it to the clause before it:
//!
//! ```json
//! [ { "data_type": "test_score", "operator": ">=", "value": "90" },
//!   { "joiner": "or", "data_type": "health", "operator": "<=", "value": 40 } ]
//! ```
//!
//! The list reads like a boolean expression: `and` binds tighter than `or`,
//! so `a or b and c` is `a or (b and c)`. Runs of `and` clauses become one
//! term and the terms are joined with `or`, left to right.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Comparator, Condition, JoinOp, Literal};
use crate::errors::{FlowError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    #[serde(default)]
    pub joiner: String,
    /// Field path into the result document.
    pub data_type: String,
    #[serde(default)]
    pub operator: String,
    pub value: Value,
}

pub fn from_clauses(clauses: &[Clause]) -> Result<Condition> {
    let mut iter = clauses.iter();
    let first = iter
        .next()
        .ok_or_else(|| FlowError::InvalidCondition("empty clause list".to_string()))?;

    // `any` holds the finished `or` terms, `all` the `and` run being built.
    let mut any: Option<Condition> = None;
    let mut all = clause_to_comparison(first)?;
    for clause in iter {
        let right = clause_to_comparison(clause)?;
        match parse_joiner(&clause.joiner) {
            JoinOp::And => all = all.and(right),
            JoinOp::Or => {
                let term = std::mem::replace(&mut all, right);
                any = Some(match any {
                    Some(terms) => terms.or(term),
                    None => term,
                });
            }
        }
    }
    Ok(match any {
        Some(terms) => terms.or(all),
        None => all,
    })
}

fn clause_to_comparison(clause: &Clause) -> Result<Condition> {
    let value = Literal::from_json(&clause.value).ok_or_else(|| {
        FlowError::InvalidCondition(format!(
            "unsupported value {} for '{}'",
            clause.value, clause.data_type
        ))
    })?;
    Ok(Condition::comparison(
        clause.data_type.trim(),
        parse_operator(&clause.operator),
        value,
    ))
}

// Unknown operators fall back to equality.
fn parse_operator(op: &str) -> Comparator {
    let op = op.trim();
    if op.contains(">=") {
        Comparator::Ge
    } else if op.contains("<=") {
        Comparator::Le
    } else if op.contains("!=") {
        Comparator::Ne
    } else if op.contains('>') {
        Comparator::Gt
    } else if op.contains('<') {
        Comparator::Lt
    } else if op.eq_ignore_ascii_case("matches") {
        Comparator::Matches
    } else {
        Comparator::Eq
    }
}

// A missing joiner continues as `and`.
fn parse_joiner(joiner: &str) -> JoinOp {
    if joiner.to_lowercase().contains("or") {
        JoinOp::Or
    } else {
        JoinOp::And
    }
}
