//! JSON progress file backend.
//!
//! The file is a plain object mapping table name to progress record. Writes
//! go to a sibling temp file which is fsynced and renamed over the original,
//! so a crash leaves either the old or the new snapshot, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ProgressBackend, ProgressMap};
use crate::error::{MigrateError, Result};

/// Progress persisted as a JSON file.
pub struct FileProgressBackend {
    path: PathBuf,
}

impl FileProgressBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Read and parse a progress file without opening a store.
    pub async fn read(path: &Path) -> Result<ProgressMap> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| {
            MigrateError::State(format!(
                "{} is not a valid progress file ({}); delete it to restart from scratch",
                path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl ProgressBackend for FileProgressBackend {
    async fn load(&self) -> Result<ProgressMap> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!("No progress file at {}", self.path.display());
            return Ok(ProgressMap::new());
        }
        let records = Self::read(&self.path).await?;
        info!(
            "Loaded progress for {} tables from {}",
            records.len(),
            self.path.display()
        );
        Ok(records)
    }

    async fn save(&self, records: &ProgressMap) -> Result<()> {
        let content = serde_json::to_vec_pretty(records)?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed progress file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
