//! Migration orchestrator - main workflow coordinator.
//!
//! A run goes through four phases: prepare the target (fresh runs only),
//! transfer all tables through the scheduler, correct sequences, and validate
//! row counts. The last two are skipped when the run is cancelled.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{recorder_tables, SourceReader, TargetWriter};
use crate::drivers::{MysqlReader, PostgresWriter};
use crate::error::{MigrateError, Result};
use crate::graph::DependencyGraph;
use crate::migrator::{MigratorConfig, TableMigrator};
use crate::progress::{ProgressStore, TableStatus};
use crate::scheduler::{OutcomeRecord, Scheduler};
use crate::sequence::{SequenceCorrector, SequenceResult};
use crate::transform::{RowTransform, RuleTransform};
use crate::verify::{ValidationReport, Validator};

/// How a run treats existing progress and target data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Forget progress for the selected tables and start them from the beginning.
    Fresh,
    /// Continue from the recorded progress.
    Resume,
}

/// Options for a migration run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,

    /// Restrict the run to these tables; `None` runs the whole catalog.
    pub tables: Option<Vec<String>>,

    /// Empty the selected target tables before a fresh run.
    pub truncate: bool,
}

impl RunOptions {
    pub fn fresh() -> Self {
        Self {
            mode: RunMode::Fresh,
            tables: None,
            truncate: true,
        }
    }

    pub fn resume() -> Self {
        Self {
            mode: RunMode::Resume,
            tables: None,
            truncate: false,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    pub mode: RunMode,

    /// Final status: completed, failed or cancelled.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,
    pub tables_blocked: usize,
    pub tables_cancelled: usize,

    /// Rows newly inserted in this run.
    pub rows_transferred: u64,

    /// Rows dropped by the row transform in this run.
    pub rows_rejected: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    pub failed_tables: Vec<String>,
    pub blocked_tables: Vec<String>,

    /// Per-table outcome.
    pub tables: Vec<OutcomeRecord>,

    pub sequences: Vec<SequenceResult>,

    /// Row-count validation, absent when the run was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every table completed, every sequence was handled and every count matched.
    pub fn is_success(&self) -> bool {
        self.status == "completed"
            && !self.sequences.iter().any(SequenceResult::is_failed)
            && self.validation.as_ref().map_or(false, ValidationReport::all_match)
    }

    /// The error describing why the run is not a success, if it is not.
    pub fn outcome_error(&self) -> Option<MigrateError> {
        if self.status == "cancelled" {
            return Some(MigrateError::Cancelled);
        }
        if self.tables_failed > 0 || self.tables_blocked > 0 {
            return Some(MigrateError::Incomplete(format!(
                "{} tables failed ({}), {} blocked ({})",
                self.tables_failed,
                self.failed_tables.join(", "),
                self.tables_blocked,
                self.blocked_tables.join(", ")
            )));
        }
        let failed_sequences: Vec<String> = self
            .sequences
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| format!("{}.{}", s.table, s.column))
            .collect();
        if !failed_sequences.is_empty() {
            return Some(MigrateError::Incomplete(format!(
                "sequence correction failed for {}",
                failed_sequences.join(", ")
            )));
        }
        if let Some(report) = &self.validation {
            let problems: Vec<&str> = report
                .problems()
                .into_iter()
                .map(|t| t.table.as_str())
                .collect();
            if !problems.is_empty() {
                return Some(MigrateError::Incomplete(format!(
                    "row counts differ for {}",
                    problems.join(", ")
                )));
            }
        }
        None
    }
}

/// Connectivity of both databases.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// Connect to each database independently and time a round trip.
pub async fn health_check(config: &Config) -> HealthCheckResult {
    let start = Instant::now();
    let source = match MysqlReader::new(&config.source, 1).await {
        Ok(reader) => {
            let result = reader.test_connection().await;
            reader.close().await;
            result
        }
        Err(e) => Err(e),
    };
    let source_latency_ms = start.elapsed().as_millis() as u64;

    let start = Instant::now();
    let target = match PostgresWriter::new(&config.target, 1).await {
        Ok(writer) => {
            let result = writer.test_connection().await;
            writer.close().await;
            result
        }
        Err(e) => Err(e),
    };
    let target_latency_ms = start.elapsed().as_millis() as u64;

    let source_error = source.err().map(|e| e.to_string());
    let target_error = target.err().map(|e| e.to_string());
    HealthCheckResult {
        source_connected: source_error.is_none(),
        source_latency_ms,
        target_connected: target_error.is_none(),
        target_latency_ms,
        healthy: source_error.is_none() && target_error.is_none(),
        source_error,
        target_error,
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    graph: DependencyGraph,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    progress: Arc<ProgressStore>,
    transform: Arc<dyn RowTransform>,
}

impl Orchestrator {
    /// Validate the table graph, open the progress file and connect both pools.
    pub async fn new(config: Config) -> Result<Self> {
        let graph = DependencyGraph::new(recorder_tables())?;
        let progress = ProgressStore::open_file(&config.migration.progress_file).await?;

        let pool_size = config.migration.pool_size();
        let source = MysqlReader::new(&config.source, pool_size).await?;
        let target = PostgresWriter::new(&config.target, pool_size).await?;

        Ok(Self::with_components(
            config,
            graph,
            Arc::new(source),
            Arc::new(target),
            Arc::new(progress),
        ))
    }

    /// Assemble an orchestrator from already-built collaborators.
    pub fn with_components(
        config: Config,
        graph: DependencyGraph,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        progress: Arc<ProgressStore>,
    ) -> Self {
        Self {
            config,
            graph,
            source,
            target,
            progress,
            transform: Arc::new(RuleTransform),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Run the migration.
    pub async fn run(&self, options: RunOptions, cancel: &CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let graph = match &options.tables {
            Some(names) => self.graph.subgraph(names)?,
            None => self.graph.clone(),
        };
        let names = graph.names();

        info!(
            "Starting migration run {} ({:?}, {} tables)",
            run_id,
            options.mode,
            graph.len()
        );

        // Phase 1: Prepare target
        match options.mode {
            RunMode::Fresh => {
                info!("Phase 1: Preparing target");
                // progress first: a failed truncate then only costs a re-copy
                self.progress.reset(&names).await?;
                if options.truncate {
                    self.target.truncate(&names).await?;
                }
            }
            RunMode::Resume => {
                let snapshot = self.progress.snapshot().await;
                let completed = names
                    .iter()
                    .filter(|n| snapshot.get(*n).map_or(false, |r| r.is_completed()))
                    .count();
                info!(
                    "Phase 1: Resuming ({} of {} tables already completed)",
                    completed,
                    names.len()
                );
            }
        }

        // Phase 2: Transfer data
        info!("Phase 2: Transferring data");
        let migrator = TableMigrator::new(
            self.source.clone(),
            self.target.clone(),
            self.progress.clone(),
            self.transform.clone(),
            MigratorConfig::from_config(&self.config.migration),
        );
        let scheduler = Scheduler::new(Arc::new(migrator), self.config.migration.max_concurrency);
        let summary = scheduler.run(&graph, cancel).await;

        let (sequences, validation) = if summary.cancelled {
            warn!("Run cancelled: skipping sequence correction and validation");
            (Vec::new(), None)
        } else {
            // Phase 3: Sequences
            info!("Phase 3: Correcting sequences");
            let sequences = SequenceCorrector::new(self.target.clone())
                .correct(graph.tables())
                .await;

            // Phase 4: Validation
            info!("Phase 4: Validating row counts");
            let validation = Validator::new(self.source.clone(), self.target.clone())
                .validate(graph.tables())
                .await;
            (sequences, Some(validation))
        };

        let status = if summary.cancelled {
            "cancelled"
        } else if summary.is_success() {
            "completed"
        } else {
            "failed"
        };

        let duration = start.elapsed().as_secs_f64();
        let rows_transferred = summary.rows_written();
        let result = MigrationResult {
            run_id,
            mode: options.mode,
            status: status.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at: Utc::now(),
            tables_total: graph.len(),
            tables_success: summary.count("completed"),
            tables_failed: summary.count("failed"),
            tables_blocked: summary.count("blocked"),
            tables_cancelled: summary.count("cancelled"),
            rows_transferred,
            rows_rejected: summary.rows_rejected(),
            rows_per_second: if duration > 0.0 {
                (rows_transferred as f64 / duration) as u64
            } else {
                0
            },
            failed_tables: summary.tables_with("failed"),
            blocked_tables: summary.tables_with("blocked"),
            tables: summary.records(),
            sequences,
            validation,
        };

        if result.is_success() && options.tables.is_none() {
            info!("Migration complete, removing progress");
            self.progress.clear().await?;
        }

        info!(
            "Run {} {}: {}/{} tables, {} rows in {:.1}s",
            result.run_id,
            result.status,
            result.tables_success,
            result.tables_total,
            result.rows_transferred,
            result.duration_seconds
        );
        Ok(result)
    }

    /// Compare source and target row counts without migrating anything.
    pub async fn validate(&self, tables: Option<&[String]>) -> Result<ValidationReport> {
        let graph = match tables {
            Some(names) => self.graph.subgraph(names)?,
            None => self.graph.clone(),
        };
        Ok(Validator::new(self.source.clone(), self.target.clone())
            .validate(graph.tables())
            .await)
    }

    /// Tables the progress store has not seen completed.
    pub async fn unfinished_tables(&self) -> Vec<String> {
        let snapshot = self.progress.snapshot().await;
        self.graph
            .names()
            .into_iter()
            .filter(|n| snapshot.get(n).map_or(true, |r| r.status != TableStatus::Completed))
            .collect()
    }

    /// Close both connection pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}
