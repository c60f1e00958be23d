//! Persistence trait for the progress map.
//!
//! The [`ProgressStore`](super::ProgressStore) owns the in-memory map and
//! decides when to persist it; backends only move whole snapshots in and out
//! of storage.

use async_trait::async_trait;

use super::ProgressMap;
use crate::error::Result;

/// Storage for progress snapshots.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
#[async_trait]
pub trait ProgressBackend: Send + Sync {
    /// Load the last persisted snapshot, or an empty map if none exists.
    async fn load(&self) -> Result<ProgressMap>;

    /// Persist a complete snapshot, replacing the previous one atomically.
    async fn save(&self, records: &ProgressMap) -> Result<()>;

    /// Remove persisted progress entirely.
    async fn clear(&self) -> Result<()>;

    /// Get the backend type identifier.
    fn backend_type(&self) -> &'static str;
}
