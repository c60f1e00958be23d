//! In-memory progress backend.
//!
//! Keeps the last saved snapshot in process memory. Nothing survives a
//! restart, so a warning is logged on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use super::{ProgressBackend, ProgressMap};
use crate::error::{MigrateError, Result};

/// Progress backend that never touches the file system.
pub struct MemoryProgressBackend {
    saved: Mutex<ProgressMap>,
    warned: AtomicBool,
}

impl MemoryProgressBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::with_records(ProgressMap::new())
    }

    /// Create a backend that starts from an existing snapshot.
    pub fn with_records(records: ProgressMap) -> Self {
        Self {
            saved: Mutex::new(records),
            warned: AtomicBool::new(false),
        }
    }

    /// Last saved snapshot.
    pub fn saved(&self) -> ProgressMap {
        self.saved.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!("Using in-memory progress backend: progress will not survive a restart");
        }
    }
}

impl Default for MemoryProgressBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressBackend for MemoryProgressBackend {
    async fn load(&self) -> Result<ProgressMap> {
        self.warn_once();
        Ok(self.saved())
    }

    async fn save(&self, records: &ProgressMap) -> Result<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| MigrateError::State("progress snapshot lock poisoned".into()))?;
        *saved = records.clone();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.save(&ProgressMap::new()).await
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
