//! SQL value types carried between the source reader, the row transform and
//! the target writer.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use super::schema::KeyValue;

/// A single column value read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (tinyint/smallint).
    I16(i16),

    /// 32-bit signed integer (mediumint/int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point.
    F32(f32),

    /// 64-bit floating point.
    F64(f64),

    /// Exact numeric.
    Decimal(Decimal),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// Timestamp without timezone, UTC by recorder convention.
    DateTime(NaiveDateTime),

    /// Timestamp carrying an explicit offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, if it holds any integer width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret the value as a pagination key.
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            SqlValue::Text(s) => Some(KeyValue::Text(s.clone())),
            other => other.as_i64().map(KeyValue::Int),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One source row, positionally aligned to `TableSpec::columns`.
pub type Row = Vec<SqlValue>;
