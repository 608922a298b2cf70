//! Where-predicates.
//!
//! Filters are nested boolean trees whose leaves compare one attribute path
//! against an operand. Operands may reference session variables (`$name`),
//! resolved against a variables scope before evaluation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::{compare_values, Value};

/// Session-variable scope. Values are JSON so callers can bind lists.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Comparison operator of a filter leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    Nin,
    #[serde(rename = "has")]
    Has,
    #[serde(rename = "!has")]
    NotHas,
    #[serde(rename = "like")]
    Like,
}

impl Op {
    /// `has` / `!has` target set-typed paths and are evaluated against
    /// membership, not a single leaf value.
    pub fn is_set_op(&self) -> bool {
        matches!(self, Op::Has | Op::NotHas)
    }
}

/// Right-hand side of a filter leaf before variable resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    List(Vec<Value>),
    Value(Value),
}

impl Operand {
    /// Resolve `$`-prefixed string operands against the variables scope.
    pub fn resolve(&self, vars: &Variables) -> Result<Operand, CoreError> {
        match self {
            Operand::Value(Value::String(s)) if s.starts_with('$') => {
                let name = &s[1..];
                let bound =
                    vars.get(name)
                        .ok_or_else(|| CoreError::SessionVariableNotFound {
                            name: name.to_string(),
                        })?;
                operand_from_json(bound).map_err(|reason| CoreError::SessionVariableNotFound {
                    name: format!("{name} ({reason})"),
                })
            }
            other => Ok(other.clone()),
        }
    }
}

fn operand_from_json(json: &serde_json::Value) -> Result<Operand, String> {
    match json {
        serde_json::Value::Array(items) => {
            let values = items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Operand::List(values))
        }
        leaf => Value::from_json(leaf).map(Operand::Value),
    }
}

/// One comparison: `[path, op, value]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub path: Vec<String>,
    pub op: Op,
    pub value: Operand,
}

impl Clause {
    pub fn new(path: &[&str], op: Op, value: impl Into<Operand>) -> Self {
        Self {
            path: path.iter().map(|s| s.to_string()).collect(),
            op,
            value: value.into(),
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl From<Vec<Value>> for Operand {
    fn from(v: Vec<Value>) -> Self {
        Operand::List(v)
    }
}

/// Nested boolean predicate tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Constant leaf; `Const(false)` makes a rule reject everything.
    Const(bool),
    Where(Clause),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn where_(path: &[&str], op: Op, value: impl Into<Operand>) -> Self {
        Filter::Where(Clause::new(path, op, value))
    }
}

/// Apply a scalar operator to the current value at a path.
///
/// Missing paths evaluate as `Null`. Cross-type comparisons are false, not
/// errors: the evaluator is a read-only oracle.
pub fn apply_scalar_op(op: Op, current: Option<&Value>, rhs: &Operand) -> bool {
    let null = Value::Null;
    let lhs = current.unwrap_or(&null);
    match (op, rhs) {
        (Op::Eq, Operand::Value(v)) => {
            compare_values(lhs, v) == Some(std::cmp::Ordering::Equal)
        }
        (Op::Ne, Operand::Value(v)) => {
            compare_values(lhs, v) != Some(std::cmp::Ordering::Equal)
        }
        (Op::Lt, Operand::Value(v)) => {
            compare_values(lhs, v) == Some(std::cmp::Ordering::Less)
        }
        (Op::Lte, Operand::Value(v)) => matches!(
            compare_values(lhs, v),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        (Op::Gt, Operand::Value(v)) => {
            compare_values(lhs, v) == Some(std::cmp::Ordering::Greater)
        }
        (Op::Gte, Operand::Value(v)) => matches!(
            compare_values(lhs, v),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        (Op::In, Operand::List(items)) => items
            .iter()
            .any(|v| compare_values(lhs, v) == Some(std::cmp::Ordering::Equal)),
        (Op::Nin, Operand::List(items)) => !items
            .iter()
            .any(|v| compare_values(lhs, v) == Some(std::cmp::Ordering::Equal)),
        (Op::Like, Operand::Value(Value::String(pattern))) => match lhs {
            Value::String(s) => like_match(pattern, s),
            _ => false,
        },
        _ => false,
    }
}

/// SQL-style `LIKE`: `%` matches any run, `_` matches one character.
pub fn like_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    // dp[i][j]: pattern[..i] matches candidate[..j]
    let mut dp = vec![vec![false; candidate.len() + 1]; pattern.len() + 1];
    dp[0][0] = true;
    for i in 1..=pattern.len() {
        if pattern[i - 1] == '%' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=pattern.len() {
        for j in 1..=candidate.len() {
            dp[i][j] = match pattern[i - 1] {
                '%' => dp[i - 1][j] || dp[i][j - 1],
                '_' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == candidate[j - 1],
            };
        }
    }
    dp[pattern.len()][candidate.len()]
}
