//! Table descriptors for the recorder dataset.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column-level cleaning applied on top of the generic text rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// `tinyint(1)` stored as 0/1, written as a PostgreSQL boolean.
    Boolean,
    /// Legacy datetime column that may hold Unix seconds.
    Timestamp,
}

/// Grouping used when listing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableCategory {
    Event,
    State,
    Statistics,
    System,
}

impl fmt::Display for TableCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableCategory::Event => "event",
            TableCategory::State => "state",
            TableCategory::Statistics => "statistics",
            TableCategory::System => "system",
        };
        f.write_str(s)
    }
}

/// Immutable description of one table to migrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSpec {
    /// Table name (identical in source and target).
    pub name: String,

    /// Columns in read/write order.
    pub columns: Vec<String>,

    /// Tables that must be loaded first because of foreign keys.
    pub dependencies: Vec<String>,

    /// Strictly monotonic primary key used for keyset pagination.
    pub key_column: String,

    /// The key is a string and is paged in byte order.
    pub text_key: bool,

    /// Columns backed by a target sequence that needs correcting after load.
    pub sequence_columns: Vec<String>,

    /// Per-column cleaning hints.
    pub transforms: BTreeMap<String, TransformKind>,

    /// Listing group.
    pub category: TableCategory,
}

impl TableSpec {
    /// Create a spec whose key column is also its only sequence column.
    pub fn new(name: &str, key_column: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            dependencies: Vec::new(),
            key_column: key_column.to_string(),
            text_key: false,
            sequence_columns: vec![key_column.to_string()],
            transforms: BTreeMap::new(),
            category: TableCategory::System,
        }
    }

    pub fn depends_on(mut self, tables: &[&str]) -> Self {
        self.dependencies = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn category(mut self, category: TableCategory) -> Self {
        self.category = category;
        self
    }

    pub fn transform(mut self, column: &str, kind: TransformKind) -> Self {
        self.transforms.insert(column.to_string(), kind);
        self
    }

    /// Mark the key as a natural key with no sequence behind it.
    pub fn without_sequence(mut self) -> Self {
        self.sequence_columns.clear();
        self
    }

    /// Mark the key as a string key. Implies no sequence.
    pub fn text_key(mut self) -> Self {
        self.text_key = true;
        self.without_sequence()
    }

    /// Position of the pagination key in `columns`.
    pub fn key_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c == &self.key_column)
    }

    pub fn transform_for(&self, column: &str) -> Option<TransformKind> {
        self.transforms.get(column).copied()
    }
}

/// Primary key value used as the keyset pagination cursor.
///
/// Serialized as a bare JSON number or string in the progress file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl KeyValue {
    /// Compare two keys of the same kind. Keys of different kinds never
    /// occur within one table and are unordered.
    pub fn compare(&self, other: &KeyValue) -> Option<Ordering> {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => Some(a.cmp(b)),
            (KeyValue::Text(a), KeyValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// True when `self` is strictly after `other`.
    pub fn is_after(&self, other: &KeyValue) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(s) => write!(f, "'{}'", s),
        }
    }
}
