// src/condition/eval.rs

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::{Comparator, Condition, JoinOp, Literal};

impl Condition {
    /// Evaluate against a result document.
    ///
    /// Missing fields, type mismatches and unparsable patterns all evaluate
    /// to `false`; evaluation never errors.
    pub fn evaluate(&self, doc: &Value) -> bool {
        match self {
            Condition::Comparison { field, op, value } => match resolve_path(doc, field) {
                Some(Value::Array(items)) => items.iter().any(|v| compare(v, *op, value)),
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
            Condition::Joiner { left, op, right } => match op {
                JoinOp::And => left.evaluate(doc) && right.evaluate(doc),
                JoinOp::Or => left.evaluate(doc) || right.evaluate(doc),
            },
        }
    }
}

/// Walk a dotted path; numeric segments index into arrays.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(doc, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn compare(actual: &Value, op: Comparator, literal: &Literal) -> bool {
    if op == Comparator::Matches {
        return matches_pattern(actual, literal);
    }

    let ordering = match literal {
        Literal::Number(expected) => {
            let Some(actual) = as_number(actual) else {
                return false;
            };
            match actual.partial_cmp(expected) {
                Some(o) => o,
                None => return false,
            }
        }
        Literal::Text(expected) => {
            let Some(actual) = actual.as_str() else {
                return false;
            };
            actual.cmp(expected.as_str())
        }
        Literal::Bool(expected) => {
            let Some(actual) = actual.as_bool() else {
                return false;
            };
            return match op {
                Comparator::Eq => actual == *expected,
                Comparator::Ne => actual != *expected,
                _ => false,
            };
        }
    };

    match op {
        Comparator::Eq => ordering == Ordering::Equal,
        Comparator::Ne => ordering != Ordering::Equal,
        Comparator::Gt => ordering == Ordering::Greater,
        Comparator::Ge => ordering != Ordering::Less,
        Comparator::Lt => ordering == Ordering::Less,
        Comparator::Le => ordering != Ordering::Greater,
        Comparator::Matches => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn matches_pattern(actual: &Value, literal: &Literal) -> bool {
    let Literal::Text(pattern) = literal else {
        return false;
    };
    let text = match actual {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return false,
    };
    match Regex::new(pattern) {
        Ok(re) => re.is_match(&text),
        Err(err) => {
            warn!(%pattern, error = %err, "unparsable condition pattern; treating as no match");
            false
        }
    }
}
