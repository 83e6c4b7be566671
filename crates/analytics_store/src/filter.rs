//! Row filters for select queries.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::cmp::Ordering;

/// A single predicate on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Column equals value
    Eq { column: String, value: Value },
    /// Column is greater than or equal to value
    Gte { column: String, value: Value },
}

/// Conjunction of conditions plus an optional row limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    limit: Option<usize>,
}

impl Filter {
    /// A filter matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `column == value`.
    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            column: column.to_string(),
            value: value.into(),
        });
        self
    }

    /// Require `column >= value`.
    ///
    /// RFC 3339 strings compare as instants, numbers numerically.
    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte {
            column: column.to_string(),
            value: value.into(),
        });
        self
    }

    /// Return at most `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Check whether a row satisfies every condition.
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq { column, value } => row.get(column) == Some(value),
            Condition::Gte { column, value } => row
                .get(column)
                .and_then(|actual| compare(actual, value))
                .is_some_and(|ord| ord != Ordering::Less),
        })
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => match (parse_instant(a), parse_instant(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.cmp(b)),
        },
        _ => None,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}
