//! In-memory implementation of CheckpointStore

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::{Checkpoint, CheckpointError, CheckpointStore};
use crate::job::JobId;

/// In-memory implementation of CheckpointStore
///
/// Checkpoints live as long as the store. Share one instance (through `Arc`)
/// between processors to resume jobs across processor restarts in tests.
///
/// # Example
///
/// ```
/// use everruns_batch::InMemoryCheckpointStore;
///
/// let store = InMemoryCheckpointStore::new();
/// assert_eq!(store.save_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<JobId, Checkpoint>>,
    saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Get the number of jobs with a checkpoint
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write();
        if let Some(existing) = checkpoints.get(&checkpoint.job_id) {
            if existing.offset >= checkpoint.offset {
                return Ok(());
            }
        }
        checkpoints.insert(checkpoint.job_id, checkpoint.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().get(&job_id).cloned())
    }

    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError> {
        self.checkpoints.write().remove(&job_id);
        Ok(())
    }
}
