//! # hass-pg-migrate
//!
//! Migration engine that moves a Home Assistant recorder database from
//! MySQL/MariaDB to PostgreSQL.
//!
//! The target schema is expected to exist already. The engine provides:
//!
//! - **Dependency ordering** so a table is copied only after the tables it
//!   references are complete
//! - **Keyset pagination** over each table's integer or text primary key
//! - **Idempotent writes** via `ON CONFLICT DO NOTHING`, so re-running a batch is safe
//! - **Resume capability** via an atomically written JSON progress file
//! - **Bounded concurrency** with blocked and cancelled table states
//! - **Sequence correction** and row-count validation after the copy
//! - **Optional `pg_dump` backup** of the target before it is truncated
//!
//! ## Example
//!
//! ```rust,no_run
//! use hass_pg_migrate::{Config, Orchestrator, RunOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hass_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator
//!         .run(RunOptions::fresh(), &CancellationToken::new())
//!         .await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod graph;
pub mod migrator;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod sequence;
pub mod transform;
pub mod verify;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use backup::backup_target;
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use crate::core::{
    find_table, recorder_tables, KeyValue, SourceReader, SqlValue, TableSpec, TargetWriter,
};
pub use error::{MigrateError, Result};
pub use graph::DependencyGraph;
pub use migrator::{MigratorConfig, TableMigrator, TableStats};
pub use orchestrator::{
    health_check, HealthCheckResult, MigrationResult, Orchestrator, RunMode, RunOptions,
};
pub use progress::{ProgressRecord, ProgressStore, TableStatus};
pub use retry::RetryPolicy;
pub use scheduler::{RunSummary, Scheduler, TableOutcome};
pub use sequence::{SequenceCorrector, SequenceResult, SequenceStatus};
pub use verify::{ValidationReport, ValidationStatus, Validator};
