//! Post-migration validation by exact row counts.
//!
//! Source and target are counted per table and compared. A count that cannot
//! be obtained is reported for that table and does not abort the rest.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::{SourceReader, TableSpec, TargetWriter};

/// Comparison outcome for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Match,
    Mismatch,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: Option<i64>,
    pub target_rows: Option<i64>,
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableValidation {
    pub fn matches(&self) -> bool {
        self.status == ValidationStatus::Match
    }
}

/// Per-table validation results in table order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub tables: Vec<TableValidation>,
}

impl ValidationReport {
    /// Every table was counted and matched.
    pub fn all_match(&self) -> bool {
        self.tables.iter().all(TableValidation::matches)
    }

    /// Tables that did not match, including those that could not be counted.
    pub fn problems(&self) -> Vec<&TableValidation> {
        self.tables.iter().filter(|t| !t.matches()).collect()
    }

    pub fn get(&self, table: &str) -> Option<&TableValidation> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Compares source and target row counts.
pub struct Validator {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
}

impl Validator {
    pub fn new(source: Arc<dyn SourceReader>, target: Arc<dyn TargetWriter>) -> Self {
        Self { source, target }
    }

    pub async fn validate(&self, tables: &[TableSpec]) -> ValidationReport {
        let mut report = ValidationReport::default();
        for table in tables {
            report.tables.push(self.validate_table(&table.name).await);
        }

        let problems = report.problems().len();
        if problems == 0 {
            info!("Validation passed for {} tables", report.tables.len());
        } else {
            warn!(
                "Validation found {} of {} tables with problems",
                problems,
                report.tables.len()
            );
        }
        report
    }

    async fn validate_table(&self, table: &str) -> TableValidation {
        let (source, target) =
            tokio::join!(self.source.row_count(table), self.target.row_count(table));

        let mut errors = Vec::new();
        let source_rows = source.map_err(|e| errors.push(format!("source: {}", e))).ok();
        let target_rows = target.map_err(|e| errors.push(format!("target: {}", e))).ok();

        let status = match (source_rows, target_rows) {
            (Some(s), Some(t)) if s == t => {
                info!("{}: {} rows (match)", table, s);
                ValidationStatus::Match
            }
            (Some(s), Some(t)) => {
                warn!("{}: source={} target={} (MISMATCH)", table, s, t);
                ValidationStatus::Mismatch
            }
            _ => {
                warn!("{}: could not be counted: {}", table, errors.join("; "));
                ValidationStatus::Error
            }
        };

        TableValidation {
            table: table.to_string(),
            source_rows,
            target_rows,
            status,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }
}
