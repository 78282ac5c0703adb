//! Row representations as they move through a batch
//!
//! `SourceRecord` (raw strings) → `NormalizedRecord` (typed, aligned with the
//! target schema) → `RowOutcome` (valid or rejected with a reason).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One raw data row, addressable by header position
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// 1-based data row number (the header is row 0)
    pub row: i64,
    pub fields: csv::StringRecord,
}

impl SourceRecord {
    pub fn new(row: i64, fields: csv::StringRecord) -> Self {
        Self { row, fields }
    }

    /// Raw field at a header position; `None` when the row is short
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index)
    }
}

/// Typed value of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by range checks
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Ordering between two non-null values of the same variant.
    ///
    /// Nulls and mixed variants are incomparable; aggregations skip them.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A row typed against a target schema; `values[i]` belongs to `columns[i]`
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub row: i64,
    pub values: Vec<Value>,
}

/// A normalized row that passed every quality rule.
///
/// Only the quality filter constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    row: i64,
    values: Vec<Value>,
}

impl ValidatedRecord {
    pub(crate) fn new(record: NormalizedRecord) -> Self {
        Self {
            row: record.row,
            values: record.values,
        }
    }

    pub fn row(&self) -> i64 {
        self.row
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Why a row was excluded from staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Undecodable row, or a non-nullable column without a usable value
    Malformed { column: Option<String> },
    NullRequiredField { column: String },
    OutOfRange { column: String },
}

impl RejectReason {
    pub fn tag(&self) -> &'static str {
        match self {
            RejectReason::Malformed { .. } => "malformed",
            RejectReason::NullRequiredField { .. } => "null_required_field",
            RejectReason::OutOfRange { .. } => "out_of_range",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed { column: Some(c) } => write!(f, "malformed value in '{}'", c),
            RejectReason::Malformed { column: None } => write!(f, "malformed row"),
            RejectReason::NullRequiredField { column } => write!(f, "'{}' is null", column),
            RejectReason::OutOfRange { column } => write!(f, "'{}' out of range", column),
        }
    }
}

/// Per-row result threaded through a batch
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Valid(ValidatedRecord),
    Rejected { row: i64, reason: RejectReason },
}
