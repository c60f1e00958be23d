//! Core traits for the two database collaborators.
//!
//! - [`SourceReader`]: keyset-paginated reads from the recorder database
//! - [`TargetWriter`]: idempotent writes and post-load repair on PostgreSQL
//!
//! The migration engine only talks to these traits, so it can be driven by
//! in-memory implementations in tests.

use async_trait::async_trait;

use crate::error::Result;

use super::schema::{KeyValue, TableSpec};
use super::value::Row;

/// Result of an insert-or-ignore write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows the target acknowledged receiving.
    pub received: u64,
    /// Rows actually inserted (the rest already existed).
    pub inserted: u64,
}

impl WriteOutcome {
    /// Rows that collided with an existing primary key.
    pub fn ignored(&self) -> u64 {
        self.received.saturating_sub(self.inserted)
    }
}

/// Trait for reading data from the source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetch up to `limit` rows whose key is strictly greater than `after`
    /// (all rows when `after` is `None`), ordered ascending by key.
    ///
    /// Values are positionally aligned to `spec.columns`.
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        after: Option<&KeyValue>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Get the exact row count for a table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// Trait for writing data to the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Insert rows, leaving rows whose primary key already exists untouched.
    ///
    /// The write is atomic: either every row is applied (inserted or
    /// ignored) or none is.
    async fn insert_ignore(&self, spec: &TableSpec, rows: &[Row]) -> Result<WriteOutcome>;

    /// `MAX(column)` over the target table, `None` when empty.
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>>;

    /// Set the sequence behind `column` so the next generated value is `next`.
    ///
    /// Returns the sequence name, or `None` when the column has no sequence.
    async fn set_sequence(&self, table: &str, column: &str, next: i64) -> Result<Option<String>>;

    /// Get the exact row count for a table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Remove all rows from `tables` in one statement and restart their
    /// identities. Tables referenced by a foreign key from outside the set
    /// cannot be truncated.
    async fn truncate(&self, tables: &[String]) -> Result<()>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Get the database type identifier.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}
