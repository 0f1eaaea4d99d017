//! CheckpointStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Error type for checkpoint store operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Counters covering every item below a checkpoint's offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCounters {
    pub processed: u64,
    pub failed: u64,
    /// Known total at the time of the checkpoint
    pub total: u64,
}

/// A durable resume point for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,

    /// Every item with an index below this has been attempted
    pub offset: u64,

    pub timestamp: DateTime<Utc>,
    pub counters: CheckpointCounters,
}

impl Checkpoint {
    pub fn new(job_id: JobId, offset: u64, counters: CheckpointCounters) -> Self {
        Self {
            job_id,
            offset,
            timestamp: Utc::now(),
            counters,
        }
    }
}

/// Persistence for job checkpoints
///
/// Implementations must keep the highest offset seen per job; a save with a
/// lower or equal offset may be ignored.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Persist a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Latest checkpoint for a job, if any
    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Forget a job's checkpoint
    async fn clear(&self, job_id: JobId) -> Result<(), CheckpointError>;
}
