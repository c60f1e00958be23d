//! Durable per-table migration progress for resume capability.
//!
//! [`ProgressStore`] is the only state shared between concurrently running
//! table migrations. Every read-modify-write goes through one async mutex and
//! the whole map is persisted before the lock is released, so concurrent
//! updates can never overwrite each other.

mod backend;
mod file;
mod memory;

pub use backend::ProgressBackend;
pub use file::FileProgressBackend;
pub use memory::MemoryProgressBackend;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::KeyValue;
use crate::error::{MigrateError, Result};

/// Table name to progress record, as persisted.
pub type ProgressMap = BTreeMap<String, ProgressRecord>;

/// Migration status of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::InProgress => "in_progress",
            TableStatus::Completed => "completed",
            TableStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Highest source key whose batch has been committed to the target.
    pub last_key: Option<KeyValue>,

    /// Source row count, fetched once.
    pub total_rows: Option<i64>,

    pub status: TableStatus,

    pub updated_at: DateTime<Utc>,

    /// Rows newly inserted into the target.
    #[serde(default)]
    pub rows_written: u64,

    /// Rows dropped by the row transform.
    #[serde(default)]
    pub rows_rejected: u64,

    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressRecord {
    pub fn pending() -> Self {
        Self {
            last_key: None,
            total_rows: None,
            status: TableStatus::Pending,
            updated_at: Utc::now(),
            rows_written: 0,
            rows_rejected: 0,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TableStatus::Completed
    }

    /// Percentage of `total_rows` accounted for, when the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total_rows {
            Some(0) if self.is_completed() => Some(100.0),
            Some(total) if total > 0 => {
                let done = (self.rows_written + self.rows_rejected) as f64;
                Some((done / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Shared, serialized access to the progress map.
pub struct ProgressStore {
    records: Mutex<ProgressMap>,
    backend: Arc<dyn ProgressBackend>,
}

impl ProgressStore {
    /// Load existing progress from `backend`.
    pub async fn open(backend: Arc<dyn ProgressBackend>) -> Result<Self> {
        let records = backend.load().await?;
        debug!(
            "Loaded {} progress records from {} backend",
            records.len(),
            backend.backend_type()
        );
        Ok(Self {
            records: Mutex::new(records),
            backend,
        })
    }

    /// Open a JSON progress file, starting empty if it does not exist.
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Arc::new(FileProgressBackend::new(path.as_ref()))).await
    }

    /// Current record for a table.
    pub async fn get(&self, table: &str) -> Option<ProgressRecord> {
        self.records.lock().await.get(table).cloned()
    }

    /// Current record for a table, creating and persisting a Pending one if absent.
    pub async fn get_or_init(&self, table: &str) -> Result<ProgressRecord> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get(table) {
            return Ok(record.clone());
        }

        let record = ProgressRecord::pending();
        records.insert(table.to_string(), record.clone());
        if let Err(e) = self.backend.save(&records).await {
            records.remove(table);
            return Err(e);
        }
        Ok(record)
    }

    /// Atomically modify a table's record and persist the whole map.
    ///
    /// Refuses with a consistency error any update that would move `last_key`
    /// backwards while the table is in progress or completed. The stored
    /// record is unchanged when the update is refused or cannot be persisted.
    pub async fn update<F>(&self, table: &str, f: F) -> Result<ProgressRecord>
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut records = self.records.lock().await;
        let previous = records.get(table).cloned();

        let mut record = previous.clone().unwrap_or_else(ProgressRecord::pending);
        f(&mut record);
        record.updated_at = Utc::now();

        if let Some(prev) = &previous {
            check_monotonic(table, prev, &record)?;
        }

        records.insert(table.to_string(), record.clone());
        if let Err(e) = self.backend.save(&records).await {
            match previous {
                Some(prev) => records.insert(table.to_string(), prev),
                None => records.remove(table),
            };
            return Err(e);
        }
        Ok(record)
    }

    /// Forget the given tables so their next run starts from the beginning.
    pub async fn reset(&self, tables: &[String]) -> Result<()> {
        let mut records = self.records.lock().await;
        let before = records.clone();
        for table in tables {
            records.remove(table);
        }
        if let Err(e) = self.backend.save(&records).await {
            *records = before;
            return Err(e);
        }
        Ok(())
    }

    /// Drop all progress, including the persisted copy.
    pub async fn clear(&self) -> Result<()> {
        let mut records = self.records.lock().await;
        self.backend.clear().await?;
        records.clear();
        Ok(())
    }

    /// Copy of every record.
    pub async fn snapshot(&self) -> ProgressMap {
        self.records.lock().await.clone()
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }
}

fn check_monotonic(table: &str, prev: &ProgressRecord, next: &ProgressRecord) -> Result<()> {
    if !matches!(
        next.status,
        TableStatus::InProgress | TableStatus::Completed
    ) {
        return Ok(());
    }
    let Some(old_key) = &prev.last_key else {
        return Ok(());
    };

    let regressed = match &next.last_key {
        None => true,
        Some(new_key) => !matches!(
            new_key.compare(old_key),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    };

    if regressed {
        return Err(MigrateError::consistency(
            table,
            format!(
                "last_key would move from {} to {}",
                old_key,
                next.last_key
                    .as_ref()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "null".to_string())
            ),
        ));
    }
    Ok(())
}
