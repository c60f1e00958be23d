//! In-memory source and target used by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{KeyValue, Row, SourceReader, SqlValue, TableSpec, TargetWriter, WriteOutcome};
use crate::error::{MigrateError, Result};

/// Tracks how many calls are running at once.
#[derive(Default)]
pub(crate) struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

fn transient(what: &str) -> MigrateError {
    MigrateError::pool("connection reset by peer", what)
}

fn take_failure(failures: &Mutex<HashMap<String, usize>>, table: &str) -> bool {
    let mut failures = failures.lock().unwrap();
    match failures.get_mut(table) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

fn key_of(spec: &TableSpec, row: &Row) -> KeyValue {
    let idx = spec.key_index().expect("key column in spec");
    row[idx].as_key().expect("row has a key")
}

/// Source tables held in memory, sorted by key on read.
#[derive(Default)]
pub(crate) struct MemorySource {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    fetch_failures: Mutex<HashMap<String, usize>>,
    fatal_tables: Mutex<HashSet<String>>,
    count_failures: Mutex<HashSet<String>>,
    pub fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, rows: Vec<Row>) -> Self {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
        self
    }

    /// Fail the next `n` fetches for `table` with a transient error.
    pub fn fail_fetches(self, table: &str, n: usize) -> Self {
        self.fetch_failures
            .lock()
            .unwrap()
            .insert(table.to_string(), n);
        self
    }

    /// Fail every fetch for `table` with a non-retryable error.
    pub fn fail_permanently(self, table: &str) -> Self {
        self.fatal_tables.lock().unwrap().insert(table.to_string());
        self
    }

    pub fn fail_counts(self, table: &str) -> Self {
        self.count_failures.lock().unwrap().insert(table.to_string());
        self
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn fetch_batch(
        &self,
        spec: &TableSpec,
        after: Option<&KeyValue>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fatal_tables.lock().unwrap().contains(&spec.name) {
            return Err(MigrateError::transfer(&spec.name, "access denied"));
        }
        if take_failure(&self.fetch_failures, &spec.name) {
            return Err(transient("reading source batch"));
        }

        let tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get(&spec.name) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<Row> = rows
            .iter()
            .filter(|r| after.map_or(true, |a| key_of(spec, r).is_after(a)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            key_of(spec, a)
                .compare(&key_of(spec, b))
                .expect("comparable keys")
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        if self.count_failures.lock().unwrap().contains(table) {
            return Err(MigrateError::transfer(table, "count timed out"));
        }
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, |rows| rows.len() as i64))
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// Target tables keyed by primary key.
#[derive(Default)]
pub(crate) struct MemoryTarget {
    tables: Mutex<HashMap<String, HashMap<KeyValue, Row>>>,
    columns: Mutex<HashMap<String, Vec<String>>>,
    write_failures: Mutex<HashMap<String, usize>>,
    fatal_tables: Mutex<HashSet<String>>,
    short_ack_tables: Mutex<HashSet<String>>,
    sequences: Mutex<HashMap<(String, String), i64>>,
    no_sequence: Mutex<HashSet<String>>,
    events: Mutex<Vec<String>>,
    /// Dependencies and expected row counts checked on every write.
    dependency_check: Mutex<Option<(HashMap<String, Vec<String>>, HashMap<String, usize>)>>,
    violations: Mutex<Vec<String>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    writes: AtomicUsize,
    write_delay: Mutex<Duration>,
    pub in_flight: InFlight,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a table, as if an earlier run had written it.
    pub fn with_rows(self, spec: &TableSpec, rows: Vec<Row>) -> Self {
        self.remember_columns(spec);
        {
            let mut tables = self.tables.lock().unwrap();
            let table = tables.entry(spec.name.clone()).or_default();
            for row in rows {
                table.insert(key_of(spec, &row), row);
            }
        }
        self
    }

    /// Fail the next `n` writes to `table` with a transient error.
    pub fn fail_writes(self, table: &str, n: usize) -> Self {
        self.write_failures
            .lock()
            .unwrap()
            .insert(table.to_string(), n);
        self
    }

    pub fn fail_permanently(self, table: &str) -> Self {
        self.fatal_tables.lock().unwrap().insert(table.to_string());
        self
    }

    /// Acknowledge one row fewer than submitted for `table`.
    pub fn short_ack(self, table: &str) -> Self {
        self.short_ack_tables
            .lock()
            .unwrap()
            .insert(table.to_string());
        self
    }

    /// Treat every column of `table` as having no backing sequence.
    pub fn without_sequences(self, table: &str) -> Self {
        self.no_sequence.lock().unwrap().insert(table.to_string());
        self
    }

    /// Record a violation whenever a table is written before its
    /// dependencies hold their full row counts.
    pub fn check_dependencies(
        self,
        deps: HashMap<String, Vec<String>>,
        expected: HashMap<String, usize>,
    ) -> Self {
        *self.dependency_check.lock().unwrap() = Some((deps, expected));
        self
    }

    /// Cancel `token` once `writes` successful writes have happened.
    pub fn cancel_after(self, writes: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((writes, token));
        self
    }

    pub fn with_write_delay(self, delay: Duration) -> Self {
        *self.write_delay.lock().unwrap() = delay;
        self
    }

    pub fn rows(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, HashMap::len)
    }

    pub fn row(&self, table: &str, key: &KeyValue) -> Option<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|t| t.get(key).cloned())
    }

    /// Every row of `table`, ordered by key.
    pub fn all_rows(&self, table: &str) -> Vec<Row> {
        let mut entries: Vec<(KeyValue, Row)> = self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.compare(&b.0).expect("comparable keys"));
        entries.into_iter().map(|(_, row)| row).collect()
    }

    pub fn sequence(&self, table: &str, column: &str) -> Option<i64> {
        self.sequences
            .lock()
            .unwrap()
            .get(&(table.to_string(), column.to_string()))
            .copied()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }

    fn remember_columns(&self, spec: &TableSpec) {
        self.columns
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.columns.clone());
    }

    fn check_dependencies_for(&self, table: &str) {
        let check = self.dependency_check.lock().unwrap();
        let Some((deps, expected)) = check.as_ref() else {
            return;
        };
        for dep in deps.get(table).into_iter().flatten() {
            let have = self.rows(dep);
            let want = expected.get(dep).copied().unwrap_or(0);
            if have != want {
                self.violations.lock().unwrap().push(format!(
                    "{} written while {} had {}/{} rows",
                    table, dep, have, want
                ));
            }
        }
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn insert_ignore(&self, spec: &TableSpec, rows: &[Row]) -> Result<WriteOutcome> {
        self.in_flight.enter();
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.apply_write(spec, rows);
        self.in_flight.exit();

        if result.is_ok() {
            let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
                if writes >= *after {
                    token.cancel();
                }
            }
        }
        result
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let idx = self
            .columns
            .lock()
            .unwrap()
            .get(table)
            .and_then(|cols| cols.iter().position(|c| c == column));
        let Some(idx) = idx else {
            return Ok(None);
        };
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.values().filter_map(|r| r[idx].as_i64()).max()))
    }

    async fn set_sequence(&self, table: &str, column: &str, next: i64) -> Result<Option<String>> {
        if self.no_sequence.lock().unwrap().contains(table) {
            return Ok(None);
        }
        if self.fatal_tables.lock().unwrap().contains(table) {
            return Err(MigrateError::transfer(table, "permission denied for sequence"));
        }
        self.sequences
            .lock()
            .unwrap()
            .insert((table.to_string(), column.to_string()), next);
        Ok(Some(format!("{}_{}_seq", table, column)))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        Ok(self.rows(table) as i64)
    }

    async fn truncate(&self, tables: &[String]) -> Result<()> {
        let mut rows = self.tables.lock().unwrap();
        let mut events = self.events.lock().unwrap();
        for table in tables {
            events.push(format!("truncate:{}", table));
            rows.remove(table);
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

impl MemoryTarget {
    fn apply_write(&self, spec: &TableSpec, rows: &[Row]) -> Result<WriteOutcome> {
        if self.fatal_tables.lock().unwrap().contains(&spec.name) {
            return Err(MigrateError::transfer(&spec.name, "violates foreign key constraint"));
        }
        if take_failure(&self.write_failures, &spec.name) {
            return Err(transient("writing target batch"));
        }
        self.check_dependencies_for(&spec.name);
        self.remember_columns(spec);
        self.events
            .lock()
            .unwrap()
            .push(format!("insert:{}", spec.name));

        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(spec.name.clone()).or_default();
        let mut inserted = 0;
        for row in rows {
            let key = key_of(spec, row);
            if !table.contains_key(&key) {
                table.insert(key, row.clone());
                inserted += 1;
            }
        }

        let mut received = rows.len() as u64;
        if self.short_ack_tables.lock().unwrap().contains(&spec.name) {
            received = received.saturating_sub(1);
        }
        Ok(WriteOutcome { received, inserted })
    }
}

/// `id, name` row for a two-column test table.
pub(crate) fn int_row(id: i64, name: &str) -> Row {
    vec![SqlValue::I64(id), SqlValue::Text(name.to_string())]
}
