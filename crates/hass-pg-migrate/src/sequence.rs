//! Post-load sequence repair.
//!
//! Rows are copied with their original primary keys, which leaves the target's
//! identity sequences at their start values. Each sequence is moved past the
//! highest migrated key so new recorder writes do not collide.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::{TableSpec, TargetWriter};

/// What happened to one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SequenceStatus {
    /// The sequence now yields `next` on its next call.
    Updated { sequence: String, next: i64 },
    /// The column has no backing sequence.
    NotSequenceBacked,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceResult {
    pub table: String,
    pub column: String,
    #[serde(flatten)]
    pub status: SequenceStatus,
}

impl SequenceResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SequenceStatus::Failed { .. })
    }
}

pub struct SequenceCorrector {
    target: Arc<dyn TargetWriter>,
}

impl SequenceCorrector {
    pub fn new(target: Arc<dyn TargetWriter>) -> Self {
        Self { target }
    }

    /// Correct the sequence of every sequence column in `tables`.
    ///
    /// A failure on one table is recorded and does not stop the others.
    pub async fn correct(&self, tables: &[TableSpec]) -> Vec<SequenceResult> {
        let mut results = Vec::new();
        for table in tables {
            for column in &table.sequence_columns {
                let status = match self.correct_one(&table.name, column).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("{}.{}: sequence correction failed: {}", table.name, column, e);
                        SequenceStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                results.push(SequenceResult {
                    table: table.name.clone(),
                    column: column.clone(),
                    status,
                });
            }
        }

        let updated = results
            .iter()
            .filter(|r| matches!(r.status, SequenceStatus::Updated { .. }))
            .count();
        info!("Corrected {} of {} sequences", updated, results.len());
        results
    }

    async fn correct_one(&self, table: &str, column: &str) -> crate::error::Result<SequenceStatus> {
        let max = self.target.max_value(table, column).await?;
        let next = next_value(max);
        match self.target.set_sequence(table, column, next).await? {
            Some(sequence) => {
                info!("{}.{}: {} restarts at {}", table, column, sequence, next);
                Ok(SequenceStatus::Updated { sequence, next })
            }
            None => Ok(SequenceStatus::NotSequenceBacked),
        }
    }
}

/// Next value to hand out after `max`; an empty table starts at 1.
fn next_value(max: Option<i64>) -> i64 {
    match max {
        Some(max) => max.saturating_add(1),
        None => 1,
    }
}
