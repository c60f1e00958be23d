//! Row cleaning between the recorder database and PostgreSQL.
//!
//! MySQL tolerates data that PostgreSQL rejects: NUL bytes in text, `''`
//! where the recorder means "no value", integers standing in for booleans and
//! legacy datetime columns holding Unix seconds. [`RuleTransform`] applies the
//! generic text and timestamp rules to every column and the per-column
//! [`TransformKind`] hints from the [`TableSpec`].

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::fmt;

use crate::core::{Row, SqlValue, TableSpec, TransformKind};

/// A row that cannot be written to the target.
#[derive(Debug, Clone, PartialEq)]
pub struct RowReject {
    /// Offending column, if the problem is column-specific.
    pub column: Option<String>,
    pub reason: String,
}

impl fmt::Display for RowReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "column {}: {}", column, self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for RowReject {}

impl RowReject {
    fn column(column: &str, reason: impl Into<String>) -> Self {
        Self {
            column: Some(column.to_string()),
            reason: reason.into(),
        }
    }
}

/// Pure per-row transform applied before writing.
pub trait RowTransform: Send + Sync {
    /// Clean one row or explain why it cannot be migrated.
    fn apply(&self, spec: &TableSpec, row: Row) -> Result<Row, RowReject>;
}

/// Rule-driven transform used for the recorder tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleTransform;

impl RowTransform for RuleTransform {
    fn apply(&self, spec: &TableSpec, row: Row) -> Result<Row, RowReject> {
        if row.len() != spec.columns.len() {
            return Err(RowReject {
                column: None,
                reason: format!(
                    "expected {} columns, got {}",
                    spec.columns.len(),
                    row.len()
                ),
            });
        }

        spec.columns
            .iter()
            .zip(row)
            .map(|(column, value)| clean_value(column, spec.transform_for(column), value))
            .collect()
    }
}

fn clean_value(
    column: &str,
    kind: Option<TransformKind>,
    value: SqlValue,
) -> Result<SqlValue, RowReject> {
    let value = match value {
        SqlValue::Text(s) => clean_text(s),
        // PostgreSQL `timestamp` columns hold naive UTC
        SqlValue::DateTimeOffset(dt) => SqlValue::DateTime(dt.with_timezone(&Utc).naive_utc()),
        other => other,
    };

    match kind {
        Some(TransformKind::Boolean) => to_bool(column, value),
        Some(TransformKind::Timestamp) => to_timestamp(column, value),
        None => Ok(value),
    }
}

fn clean_text(s: String) -> SqlValue {
    let s = if s.contains('\0') { s.replace('\0', "") } else { s };
    if s.is_empty() {
        SqlValue::Null
    } else {
        SqlValue::Text(s)
    }
}

fn to_bool(column: &str, value: SqlValue) -> Result<SqlValue, RowReject> {
    match value {
        SqlValue::Null | SqlValue::Bool(_) => Ok(value),
        other => match other.as_i64() {
            Some(0) => Ok(SqlValue::Bool(false)),
            Some(1) => Ok(SqlValue::Bool(true)),
            Some(n) => Err(RowReject::column(column, format!("non-boolean integer {}", n))),
            None => Err(RowReject::column(
                column,
                format!("cannot convert {:?} to boolean", other),
            )),
        },
    }
}

fn to_timestamp(column: &str, value: SqlValue) -> Result<SqlValue, RowReject> {
    let seconds = match &value {
        SqlValue::F64(f) => *f,
        SqlValue::F32(f) => f64::from(*f),
        SqlValue::Decimal(d) => match d.to_f64() {
            Some(f) => f,
            None => return Err(RowReject::column(column, format!("invalid timestamp {}", d))),
        },
        other => match other.as_i64() {
            Some(n) => n as f64,
            None => return Ok(value),
        },
    };

    unix_to_naive(seconds)
        .map(SqlValue::DateTime)
        .ok_or_else(|| RowReject::column(column, format!("invalid timestamp {}", seconds)))
}

/// Convert Unix seconds to a naive UTC datetime, `None` when out of range.
fn unix_to_naive(seconds: f64) -> Option<NaiveDateTime> {
    if !seconds.is_finite() || seconds.abs() > i64::MAX as f64 {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
    let (whole, nanos) = if nanos >= 1_000_000_000 {
        (whole + 1.0, 0)
    } else {
        (whole, nanos)
    };
    DateTime::from_timestamp(whole as i64, nanos).map(|dt| dt.naive_utc())
}
