//! Progress reporting

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::job::{BatchJob, BatchStatus, JobId};

/// Snapshot of a job's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub status: BatchStatus,
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    pub percentage: f64,
    /// Last persisted checkpoint offset
    pub checkpoint_offset: Option<u64>,
}

impl ProgressUpdate {
    pub(crate) fn from_job(job: &BatchJob, checkpoint_offset: Option<u64>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            processed: job.processed_items,
            failed: job.failed_items,
            total: job.total_items,
            percentage: job.progress_percentage,
            checkpoint_offset,
        }
    }
}

/// Receives progress at checkpoint boundaries and at terminal state
///
/// Called from the job's orchestrating task; implementations should return
/// quickly and hand slow work off elsewhere.
pub trait ProgressReporter: Send + Sync + 'static {
    fn report(&self, update: &ProgressUpdate);
}

/// Logs progress through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressReporter;

impl ProgressReporter for TracingProgressReporter {
    fn report(&self, update: &ProgressUpdate) {
        info!(
            job_id = %update.job_id,
            status = %update.status,
            processed = update.processed,
            failed = update.failed,
            total = update.total,
            checkpoint_offset = ?update.checkpoint_offset,
            "batch progress {:.1}%",
            update.percentage
        );
    }
}

/// Discards progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressReporter;

impl ProgressReporter for NoopProgressReporter {
    fn report(&self, _update: &ProgressUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::job::{JobMetadata, JobStore};

    #[test]
    fn test_update_from_job() {
        let store = JobStore::new();
        let id = JobId::new();
        store
            .create(id, Some(8), JobMetadata::new(BatchConfig::default()))
            .unwrap();
        let job = store
            .apply(id, |job| {
                job.processed_items = 3;
                job.failed_items = 1;
            })
            .unwrap();

        let update = ProgressUpdate::from_job(&job, Some(4));
        assert_eq!(update.processed, 3);
        assert_eq!(update.failed, 1);
        assert_eq!(update.total, 8);
        assert_eq!(update.percentage, 50.0);
        assert_eq!(update.checkpoint_offset, Some(4));
    }

    #[test]
    fn test_reporters_accept_updates() {
        let update = ProgressUpdate {
            job_id: JobId::new(),
            status: BatchStatus::Running,
            processed: 1,
            failed: 0,
            total: 2,
            percentage: 50.0,
            checkpoint_offset: None,
        };
        TracingProgressReporter.report(&update);
        NoopProgressReporter.report(&update);
    }
}
