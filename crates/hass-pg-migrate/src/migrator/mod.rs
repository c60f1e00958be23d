//! Single-table copy using keyset pagination.
//!
//! A table is copied in batches ordered by its key column. Each batch is
//! written with insert-or-ignore and only then recorded in the progress store,
//! so a crash between the two leaves rows that the next run will skip over
//! rather than duplicate.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::core::{KeyValue, Row, SourceReader, TableSpec, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::progress::{ProgressStore, TableStatus};
use crate::retry::{classify_error, RetryError, RetryPolicy};
use crate::transform::RowTransform;

/// Settings for the table migrator.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Rows requested per source batch.
    pub batch_size: usize,

    /// Backoff for transient source/target errors.
    pub retry: RetryPolicy,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl MigratorConfig {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Statistics for one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStats {
    /// Rows read from the source in this run.
    pub rows_read: u64,

    /// Rows newly inserted into the target in this run.
    pub rows_written: u64,

    /// Rows that already existed in the target.
    pub rows_ignored: u64,

    /// Rows dropped by the row transform.
    pub rows_rejected: u64,

    /// Batches committed in this run.
    pub batches: u64,

    /// Key of the last committed batch.
    pub last_key: Option<KeyValue>,

    /// The table was already complete and nothing was read.
    pub already_completed: bool,

    pub duration: Duration,
}

impl TableStats {
    pub fn rows_per_second(&self) -> u64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            (self.rows_read as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Copies one table from source to target.
pub struct TableMigrator {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    progress: Arc<ProgressStore>,
    transform: Arc<dyn RowTransform>,
    config: MigratorConfig,
}

impl TableMigrator {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        progress: Arc<ProgressStore>,
        transform: Arc<dyn RowTransform>,
        config: MigratorConfig,
    ) -> Self {
        Self {
            source,
            target,
            progress,
            transform,
            config,
        }
    }

    /// Copy `spec` from its recorded position to the end of the source table.
    ///
    /// Returns [`MigrateError::Cancelled`] when `cancel` fires; the table is
    /// then left in progress at its last committed batch. Any other error
    /// marks the table failed, keeping its last committed key.
    pub async fn migrate(&self, spec: &TableSpec, cancel: &CancellationToken) -> Result<TableStats> {
        let start = Instant::now();
        let mut stats = TableStats::default();

        let result = self.copy_table(spec, cancel, &mut stats).await;
        stats.duration = start.elapsed();

        match result {
            Ok(()) => {
                if !stats.already_completed {
                    info!(
                        "{}: completed, {} rows written, {} already present, {} rejected in {:.1}s ({} rows/sec)",
                        spec.name,
                        stats.rows_written,
                        stats.rows_ignored,
                        stats.rows_rejected,
                        stats.duration.as_secs_f64(),
                        stats.rows_per_second()
                    );
                }
                Ok(stats)
            }
            Err(MigrateError::Cancelled) => {
                info!(
                    "{}: cancelled after {} batches, resumable from {}",
                    spec.name,
                    stats.batches,
                    describe_key(stats.last_key.as_ref())
                );
                Err(MigrateError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(persist) = self
                    .progress
                    .update(&spec.name, |r| {
                        r.status = TableStatus::Failed;
                        r.error = Some(message);
                    })
                    .await
                {
                    warn!("{}: could not record failure: {}", spec.name, persist);
                }
                Err(e)
            }
        }
    }

    async fn copy_table(
        &self,
        spec: &TableSpec,
        cancel: &CancellationToken,
        stats: &mut TableStats,
    ) -> Result<()> {
        let key_index = spec.key_index().ok_or_else(|| {
            MigrateError::Config(format!(
                "table {}: key column {} is not in the column list",
                spec.name, spec.key_column
            ))
        })?;

        let record = self.progress.get_or_init(&spec.name).await?;
        if record.is_completed() {
            debug!("{}: already completed, skipping", spec.name);
            stats.already_completed = true;
            stats.last_key = record.last_key;
            return Ok(());
        }

        let total_rows = match record.total_rows {
            Some(total) => Some(total),
            None => match self
                .with_retry(spec, "counting source rows", || {
                    self.source.row_count(&spec.name)
                })
                .await
            {
                Ok(total) => Some(total),
                Err(e) => {
                    warn!("{}: could not count source rows: {}", spec.name, e);
                    None
                }
            },
        };

        let mut last_key = record.last_key;
        self.progress
            .update(&spec.name, |r| {
                r.status = TableStatus::InProgress;
                r.total_rows = total_rows;
                r.error = None;
            })
            .await?;

        info!(
            "{}: starting from {} ({} source rows)",
            spec.name,
            describe_key(last_key.as_ref()),
            total_rows.map_or_else(|| "unknown".to_string(), |t| t.to_string())
        );

        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let batch_size = self.config.batch_size;
            let after = last_key.as_ref();
            let batch = self
                .with_retry(spec, "reading batch", || {
                    self.source.fetch_batch(spec, after, batch_size)
                })
                .await?;

            if batch.is_empty() {
                self.progress
                    .update(&spec.name, |r| r.status = TableStatus::Completed)
                    .await?;
                return Ok(());
            }

            let batch_key = batch_max_key(spec, key_index, &batch, last_key.as_ref())?;
            let fetched = batch.len() as u64;

            let mut clean = Vec::with_capacity(batch.len());
            let mut rejected = 0u64;
            for row in batch {
                let key = row[key_index].as_key();
                match self.transform.apply(spec, row) {
                    Ok(row) => clean.push(row),
                    Err(reject) => {
                        rejected += 1;
                        warn!(
                            "{}: skipping row {}: {}",
                            spec.name,
                            describe_key(key.as_ref()),
                            reject
                        );
                    }
                }
            }

            let (inserted, ignored) = if clean.is_empty() {
                (0, 0)
            } else {
                let rows = &clean;
                let outcome = self
                    .with_retry(spec, "writing batch", || {
                        self.target.insert_ignore(spec, rows)
                    })
                    .await?;
                if outcome.received != clean.len() as u64 {
                    return Err(MigrateError::consistency(
                        &spec.name,
                        format!(
                            "target acknowledged {} of {} rows in batch ending at {}",
                            outcome.received,
                            clean.len(),
                            batch_key
                        ),
                    ));
                }
                (outcome.inserted, outcome.ignored())
            };

            let committed = batch_key.clone();
            self.progress
                .update(&spec.name, |r| {
                    r.last_key = Some(committed);
                    r.rows_written += inserted;
                    r.rows_rejected += rejected;
                })
                .await?;

            stats.rows_read += fetched;
            stats.rows_written += inserted;
            stats.rows_ignored += ignored;
            stats.rows_rejected += rejected;
            stats.batches += 1;
            stats.last_key = Some(batch_key.clone());

            debug!(
                "{}: batch {} up to {} ({} inserted, {} ignored, {} rejected)",
                spec.name, stats.batches, batch_key, inserted, ignored, rejected
            );
            last_key = Some(batch_key);
        }
    }

    /// Run a source or target call under the retry policy.
    async fn with_retry<T, F, Fut>(&self, spec: &TableSpec, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        policy
            .run(op, classify_error, |attempt, err, delay| {
                warn!(
                    "{}: {} failed (attempt {}/{}), retrying in {:?}: {}",
                    spec.name, what, attempt, policy.max_attempts, delay, err
                );
            })
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::AttemptsExceeded(e) => MigrateError::transfer(
                    &spec.name,
                    format!(
                        "{} failed after {} attempts: {}",
                        what, policy.max_attempts, e
                    ),
                ),
            })
    }
}

/// Largest key in the batch, which must lie strictly after the cursor.
///
/// Rejected rows count too: skipping past them is what keeps the cursor
/// moving.
fn batch_max_key(
    spec: &TableSpec,
    key_index: usize,
    batch: &[Row],
    after: Option<&KeyValue>,
) -> Result<KeyValue> {
    let mut max: Option<KeyValue> = None;
    for row in batch {
        let key = row.get(key_index).and_then(|v| v.as_key()).ok_or_else(|| {
            MigrateError::consistency(
                &spec.name,
                format!("source row without a usable {} value", spec.key_column),
            )
        })?;
        max = match max {
            Some(current) if !key.is_after(&current) => Some(current),
            _ => Some(key),
        };
    }

    let max = max.ok_or_else(|| MigrateError::consistency(&spec.name, "empty batch"))?;
    if let Some(after) = after {
        if !max.is_after(after) {
            return Err(MigrateError::consistency(
                &spec.name,
                format!("batch key {} does not advance past {}", max, after),
            ));
        }
    }
    Ok(max)
}

fn describe_key(key: Option<&KeyValue>) -> String {
    match key {
        Some(key) => format!("key {}", key),
        None => "the beginning".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::progress::MemoryProgressBackend;
    use crate::testing::{int_row, MemorySource, MemoryTarget};
    use crate::transform::RuleTransform;

    fn items() -> TableSpec {
        TableSpec::new("items", "id", &["id", "name"])
    }

    fn rows(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
        range.map(|i| int_row(i, &format!("item {}", i))).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO, Duration::ZERO)
    }

    async fn store() -> Arc<ProgressStore> {
        Arc::new(
            ProgressStore::open(Arc::new(MemoryProgressBackend::new()))
                .await
                .unwrap(),
        )
    }

    fn migrator(
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        progress: Arc<ProgressStore>,
        batch_size: usize,
    ) -> TableMigrator {
        TableMigrator::new(
            source,
            target,
            progress,
            Arc::new(RuleTransform),
            MigratorConfig {
                batch_size,
                retry: fast_retry(),
            },
        )
    }

    #[tokio::test]
    async fn test_copies_all_rows_in_batches() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=25)));
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source.clone(), target.clone(), progress.clone(), 10);

        let stats = m.migrate(&items(), &CancellationToken::new()).await.unwrap();

        assert_eq!(stats.rows_read, 25);
        assert_eq!(stats.rows_written, 25);
        assert_eq!(stats.batches, 3);
        assert_eq!(target.rows("items"), 25);
        // 3 full/partial batches plus the empty one
        assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 4);

        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Completed);
        assert_eq!(record.last_key, Some(KeyValue::Int(25)));
        assert_eq!(record.total_rows, Some(25));
        assert_eq!(record.rows_written, 25);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_batch_size() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=20)));
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source.clone(), target.clone(), progress.clone(), 10);

        let stats = m.migrate(&items(), &CancellationToken::new()).await.unwrap();

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.rows_written, 20);
        assert_eq!(stats.last_key, Some(KeyValue::Int(20)));
        // two full batches, then the empty read that ends the table
        assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Completed);
        assert_eq!(record.last_key, Some(KeyValue::Int(20)));
    }

    #[tokio::test]
    async fn test_replayed_batch_inserts_nothing() {
        let target = MemoryTarget::new();
        let batch = rows(1..=5);

        let first = target.insert_ignore(&items(), &batch).await.unwrap();
        let second = target.insert_ignore(&items(), &batch).await.unwrap();

        assert_eq!((first.received, first.inserted), (5, 5));
        assert_eq!((second.received, second.inserted), (5, 0));
        assert_eq!(second.ignored(), 5);
        assert_eq!(target.rows("items"), 5);
        assert_eq!(target.all_rows("items"), batch);
    }

    #[tokio::test]
    async fn test_empty_table_completes() {
        let source = Arc::new(MemorySource::new());
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source, target, progress.clone(), 10);

        let stats = m.migrate(&items(), &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.rows_read, 0);
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Completed);
        assert_eq!(record.last_key, None);
    }

    #[tokio::test]
    async fn test_completed_table_is_not_read() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=5)));
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        progress
            .update("items", |r| {
                r.status = TableStatus::Completed;
                r.last_key = Some(KeyValue::Int(5));
            })
            .await
            .unwrap();
        let m = migrator(source.clone(), target.clone(), progress, 10);

        let stats = m.migrate(&items(), &CancellationToken::new()).await.unwrap();
        assert!(stats.already_completed);
        assert_eq!(source.fetches.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(target.rows("items"), 0);
    }

    #[tokio::test]
    async fn test_resume_continues_after_last_key() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=30)));
        // first 10 rows were committed, and rows 11..=12 landed before a crash
        let target = Arc::new(MemoryTarget::new().with_rows(&items(), rows(1..=12)));
        let progress = store().await;
        progress
            .update("items", |r| {
                r.status = TableStatus::InProgress;
                r.last_key = Some(KeyValue::Int(10));
                r.total_rows = Some(30);
                r.rows_written = 10;
            })
            .await
            .unwrap();
        let m = migrator(source.clone(), target.clone(), progress.clone(), 10);

        let stats = m.migrate(&items(), &CancellationToken::new()).await.unwrap();

        assert_eq!(stats.rows_read, 20);
        assert_eq!(stats.rows_written, 18);
        assert_eq!(stats.rows_ignored, 2);
        assert_eq!(target.rows("items"), 30);
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.rows_written, 28);
        assert_eq!(record.last_key, Some(KeyValue::Int(30)));

        // same table as a run that was never interrupted
        let uninterrupted = Arc::new(MemoryTarget::new());
        migrator(source, uninterrupted.clone(), store().await, 10)
            .migrate(&items(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(target.all_rows("items"), uninterrupted.all_rows("items"));
        assert_eq!(target.all_rows("items"), rows(1..=30));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let source = Arc::new(
            MemorySource::new()
                .with_table("items", rows(1..=5))
                .fail_fetches("items", 2),
        );
        let target = Arc::new(MemoryTarget::new().fail_writes("items", 2));
        let progress = store().await;
        let m = migrator(source, target.clone(), progress.clone(), 10);

        m.migrate(&items(), &CancellationToken::new()).await.unwrap();
        assert_eq!(target.rows("items"), 5);
        assert_eq!(
            progress.get("items").await.unwrap().status,
            TableStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let source = Arc::new(
            MemorySource::new()
                .with_table("items", rows(1..=25))
                .fail_fetches("items", 10),
        );
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source, target, progress.clone(), 10);

        let err = m
            .migrate(&items(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Transfer { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Failed);
        assert!(record.error.is_some());
        assert_eq!(record.last_key, None);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_committed_key() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=25)));
        let progress = store().await;

        let token = CancellationToken::new();
        let target = Arc::new(MemoryTarget::new().cancel_after(1, token.clone()));
        let first = migrator(source.clone(), target, progress.clone(), 10);
        assert!(matches!(
            first.migrate(&items(), &token).await,
            Err(MigrateError::Cancelled)
        ));
        assert_eq!(
            progress.get("items").await.unwrap().last_key,
            Some(KeyValue::Int(10))
        );

        let failing = Arc::new(MemoryTarget::new().fail_permanently("items"));
        let second = migrator(source, failing, progress.clone(), 10);
        let err = second
            .migrate(&items(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Failed);
        assert_eq!(record.last_key, Some(KeyValue::Int(10)));
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let token = CancellationToken::new();
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=50)));
        let target = Arc::new(MemoryTarget::new().cancel_after(2, token.clone()));
        let progress = store().await;
        let m = migrator(source, target.clone(), progress.clone(), 10);

        let err = m.migrate(&items(), &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert_eq!(target.rows("items"), 20);
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::InProgress);
        assert_eq!(record.last_key, Some(KeyValue::Int(20)));
    }

    #[tokio::test]
    async fn test_rejected_rows_still_advance_cursor() {
        let spec = TableSpec::new("runs", "run_id", &["run_id", "closed_incorrect"])
            .transform("closed_incorrect", crate::core::TransformKind::Boolean);
        let source_rows = vec![
            vec![SqlValue::I64(1), SqlValue::I16(0)],
            vec![SqlValue::I64(2), SqlValue::I16(5)],
            vec![SqlValue::I64(3), SqlValue::I16(1)],
        ];
        let source = Arc::new(MemorySource::new().with_table("runs", source_rows));
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source, target.clone(), progress.clone(), 10);

        let stats = m.migrate(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.rows_rejected, 1);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(
            target.row("runs", &KeyValue::Int(3)).unwrap()[1],
            SqlValue::Bool(true)
        );
        let record = progress.get("runs").await.unwrap();
        assert_eq!(record.rows_rejected, 1);
        assert_eq!(record.last_key, Some(KeyValue::Int(3)));
    }

    #[tokio::test]
    async fn test_short_acknowledgement_is_consistency_error() {
        let source = Arc::new(MemorySource::new().with_table("items", rows(1..=5)));
        let target = Arc::new(MemoryTarget::new().short_ack("items"));
        let progress = store().await;
        let m = migrator(source, target, progress.clone(), 10);

        let err = m
            .migrate(&items(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Consistency { .. }));
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Failed);
        assert_eq!(record.last_key, None);
    }

    #[tokio::test]
    async fn test_count_failure_is_not_fatal() {
        let source = Arc::new(
            MemorySource::new()
                .with_table("items", rows(1..=3))
                .fail_counts("items"),
        );
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source, target, progress.clone(), 10);

        m.migrate(&items(), &CancellationToken::new()).await.unwrap();
        let record = progress.get("items").await.unwrap();
        assert_eq!(record.status, TableStatus::Completed);
        assert_eq!(record.total_rows, None);
    }

    #[tokio::test]
    async fn test_text_keys() {
        let spec = crate::core::find_table("migration_changes").unwrap();
        let source_rows = vec![
            vec![SqlValue::Text("b".into()), SqlValue::I16(1)],
            vec![SqlValue::Text("a".into()), SqlValue::I16(2)],
        ];
        let source = Arc::new(MemorySource::new().with_table("migration_changes", source_rows));
        let target = Arc::new(MemoryTarget::new());
        let progress = store().await;
        let m = migrator(source, target.clone(), progress.clone(), 1);

        let stats = m.migrate(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(
            progress.get("migration_changes").await.unwrap().last_key,
            Some(KeyValue::Text("b".into()))
        );
    }

    #[test]
    fn test_batch_key_must_advance() {
        let spec = items();
        let batch = rows(5..=7);
        assert_eq!(
            batch_max_key(&spec, 0, &batch, Some(&KeyValue::Int(4))).unwrap(),
            KeyValue::Int(7)
        );
        let err = batch_max_key(&spec, 0, &batch, Some(&KeyValue::Int(7))).unwrap_err();
        assert!(matches!(err, MigrateError::Consistency { .. }));

        let keyless = vec![vec![SqlValue::Null, SqlValue::Text("x".into())]];
        assert!(batch_max_key(&spec, 0, &keyless, None).is_err());
    }
}
