//! Dependency-aware parallel execution of table migrations.
//!
//! A table starts as soon as every table it depends on has completed and a
//! concurrency slot is free. When a table fails, everything that depends on
//! it (directly or transitively) is reported as blocked and never started.
//! Cancellation stops new starts; running tables stop at their next batch
//! boundary.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::MigrateError;
use crate::graph::DependencyGraph;
use crate::migrator::{TableMigrator, TableStats};

/// Terminal result of one table within a run.
#[derive(Debug, Clone)]
pub enum TableOutcome {
    Completed(TableStats),
    Failed(String),
    /// Not started because a dependency failed or was itself blocked.
    Blocked { dependency: String },
    /// Not finished because the run was cancelled.
    Cancelled,
}

impl TableOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TableOutcome::Completed(_) => "completed",
            TableOutcome::Failed(_) => "failed",
            TableOutcome::Blocked { .. } => "blocked",
            TableOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TableOutcome::Completed(_))
    }
}

impl fmt::Display for TableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOutcome::Completed(stats) => write!(f, "completed ({} rows)", stats.rows_written),
            TableOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            TableOutcome::Blocked { dependency } => write!(f, "blocked by {}", dependency),
            TableOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Per-table outcomes of a scheduler run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub outcomes: BTreeMap<String, TableOutcome>,
    /// Completion order of the tables that completed.
    pub completion_order: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    /// Every table completed.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.values().all(TableOutcome::is_completed)
    }

    pub fn tables_with(&self, label: &str) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.label() == label)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes.values().filter(|o| o.label() == label).count()
    }

    pub fn rows_written(&self) -> u64 {
        self.completed_stats().map(|s| s.rows_written).sum()
    }

    pub fn rows_rejected(&self) -> u64 {
        self.completed_stats().map(|s| s.rows_rejected).sum()
    }

    fn completed_stats(&self) -> impl Iterator<Item = &TableStats> {
        self.outcomes.values().filter_map(|o| match o {
            TableOutcome::Completed(stats) => Some(stats),
            _ => None,
        })
    }
}

/// Summary row suitable for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub table: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub rows_written: u64,
    pub rows_rejected: u64,
}

impl RunSummary {
    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.outcomes
            .iter()
            .map(|(table, outcome)| {
                let (detail, written, rejected) = match outcome {
                    TableOutcome::Completed(s) => (None, s.rows_written, s.rows_rejected),
                    TableOutcome::Failed(reason) => (Some(reason.clone()), 0, 0),
                    TableOutcome::Blocked { dependency } => (Some(dependency.clone()), 0, 0),
                    TableOutcome::Cancelled => (None, 0, 0),
                };
                OutcomeRecord {
                    table: table.clone(),
                    outcome: outcome.label(),
                    detail,
                    rows_written: written,
                    rows_rejected: rejected,
                }
            })
            .collect()
    }
}

/// Runs table migrations in dependency order with bounded parallelism.
pub struct Scheduler {
    migrator: Arc<TableMigrator>,
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(migrator: Arc<TableMigrator>, max_concurrency: usize) -> Self {
        Self {
            migrator,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Migrate every table in `graph`, returning once each has reached a
    /// terminal outcome.
    pub async fn run(&self, graph: &DependencyGraph, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut completed: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut tasks = JoinSet::new();

        loop {
            self.block_dependents(graph, &mut started, &mut summary);

            if !cancel.is_cancelled() {
                for spec in graph.ready(&completed, &started) {
                    if tasks.len() >= self.max_concurrency {
                        break;
                    }
                    started.insert(spec.name.clone());

                    let migrator = self.migrator.clone();
                    let token = cancel.clone();
                    let span = info_span!("table", name = %spec.name);
                    tasks.spawn(
                        async move {
                            let result = AssertUnwindSafe(migrator.migrate(&spec, &token))
                                .catch_unwind()
                                .await;
                            (spec.name, result)
                        }
                        .instrument(span),
                    );
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let (table, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // the task body catches panics, so this is a runtime shutdown
                    error!("Table task aborted: {}", e);
                    continue;
                }
            };

            let outcome = match result {
                Ok(Ok(stats)) => {
                    completed.insert(table.clone());
                    summary.completion_order.push(table.clone());
                    TableOutcome::Completed(stats)
                }
                Ok(Err(MigrateError::Cancelled)) => TableOutcome::Cancelled,
                Ok(Err(e)) => {
                    error!("{}: failed: {}", table, e);
                    TableOutcome::Failed(e.to_string())
                }
                Err(panic) => {
                    let reason = panic_message(panic);
                    error!("{}: panicked: {}", table, reason);
                    TableOutcome::Failed(format!("panicked: {}", reason))
                }
            };
            summary.outcomes.insert(table, outcome);
        }

        summary.cancelled = cancel.is_cancelled();
        for table in graph.tables() {
            if !summary.outcomes.contains_key(&table.name) {
                summary
                    .outcomes
                    .insert(table.name.clone(), TableOutcome::Cancelled);
            }
        }

        info!(
            "Scheduler finished: {} completed, {} failed, {} blocked, {} cancelled",
            summary.count("completed"),
            summary.count("failed"),
            summary.count("blocked"),
            summary.count("cancelled")
        );
        summary
    }

    /// Mark every not-yet-started table with a failed or blocked dependency
    /// as blocked, until no more can be marked.
    fn block_dependents(
        &self,
        graph: &DependencyGraph,
        started: &mut HashSet<String>,
        summary: &mut RunSummary,
    ) {
        loop {
            let mut changed = false;
            for table in graph.tables() {
                if started.contains(&table.name) {
                    continue;
                }
                let culprit = table.dependencies.iter().find(|d| {
                    matches!(
                        summary.outcomes.get(*d),
                        Some(TableOutcome::Failed(_) | TableOutcome::Blocked { .. })
                    )
                });
                if let Some(dep) = culprit {
                    warn!("{}: blocked by {}", table.name, dep);
                    started.insert(table.name.clone());
                    summary.outcomes.insert(
                        table.name.clone(),
                        TableOutcome::Blocked {
                            dependency: dep.clone(),
                        },
                    );
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
