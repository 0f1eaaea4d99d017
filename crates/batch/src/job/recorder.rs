//! Single writer for a running job

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::model::{BatchStatus, BatchSummary, ItemFailure, ItemResult, JobId};
use super::store::JobStore;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::BatchError;
use crate::progress::{ProgressReporter, ProgressUpdate};

/// Item failures kept in a [`BatchSummary`]; later failures are only counted
pub const MAX_RETAINED_FAILURES: usize = 256;

/// Applies item results to a job's counters and drives checkpoints
///
/// Owned by the task orchestrating the run. Workers never touch the job
/// record; their results reach it through this type only.
pub(crate) struct JobRecorder {
    store: Arc<JobStore>,
    job_id: JobId,
    checkpoints: CheckpointManager,
    reporter: Option<Arc<dyn ProgressReporter>>,
    known_total: u64,
    discovered: u64,
    retried_items: u64,
    failures: Vec<ItemFailure>,
}

impl JobRecorder {
    pub(crate) fn new(
        store: Arc<JobStore>,
        job_id: JobId,
        known_total: u64,
        checkpoints: CheckpointManager,
        reporter: Option<Arc<dyn ProgressReporter>>,
    ) -> Self {
        Self {
            store,
            job_id,
            checkpoints,
            reporter,
            known_total,
            discovered: 0,
            retried_items: 0,
            failures: Vec::new(),
        }
    }

    pub(crate) fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Restore counters from a checkpoint; items below its offset are skipped
    pub(crate) fn resume(&mut self, checkpoint: &Checkpoint) -> Result<(), BatchError> {
        self.checkpoints.resume_from(checkpoint);
        self.discovered = checkpoint.offset;
        let counters = checkpoint.counters;
        let job = self.store.apply(self.job_id, |job| {
            job.processed_items = counters.processed;
            job.failed_items = counters.failed;
            job.total_items = job.total_items.max(counters.total);
        })?;
        self.known_total = job.total_items;
        Ok(())
    }

    /// Note that the item at `index` was pulled from the source
    pub(crate) fn observe_dispatch(&mut self, index: u64) -> Result<(), BatchError> {
        self.discovered = self.discovered.max(index + 1);
        if self.discovered > self.known_total {
            let discovered = self.discovered;
            let job = self.store.apply(self.job_id, |job| {
                job.total_items = job.total_items.max(discovered);
            })?;
            self.known_total = job.total_items;
        }
        Ok(())
    }

    /// Apply one item result
    ///
    /// Saves a checkpoint when `checkpoint_interval` items have been attempted
    /// since the last one.
    pub(crate) async fn record(&mut self, result: &ItemResult) -> Result<(), BatchError> {
        // Interrupted items hold the watermark back so a resumed run picks them up again
        if !result.is_final() {
            debug!(
                job_id = %self.job_id,
                index = result.index,
                attempts = result.attempts,
                "item interrupted before its retries ran out"
            );
            return Ok(());
        }

        // Fatal items stay below the watermark so a resumed run retries them
        if !result.is_fatal() && !self.checkpoints.record(result.index, result.is_success()) {
            debug!(
                job_id = %self.job_id,
                index = result.index,
                "ignoring result for an item that was already recorded"
            );
            return Ok(());
        }

        let success = result.is_success();
        self.store.apply(self.job_id, |job| {
            if success {
                job.processed_items += 1;
            } else {
                job.failed_items += 1;
            }
        })?;

        if result.was_retried() {
            self.retried_items += 1;
        }
        if let Some(reason) = result.reason() {
            if self.failures.len() < MAX_RETAINED_FAILURES {
                self.failures.push(ItemFailure {
                    index: result.index,
                    attempts: result.attempts,
                    reason: reason.to_string(),
                });
            }
        }

        if self.checkpoints.is_due() && self.save_checkpoint().await {
            self.report_progress();
        }
        Ok(())
    }

    /// Checkpoint and report progress; called by strategies between chunks
    /// and windows
    pub(crate) async fn checkpoint_boundary(&mut self) {
        self.save_checkpoint().await;
        self.report_progress();
    }

    /// Contiguous count of attempted items
    pub(crate) fn offset(&self) -> u64 {
        self.checkpoints.offset()
    }

    /// Write the final checkpoint, move the job to `status` and build the summary
    pub(crate) async fn finish(
        mut self,
        status: BatchStatus,
        error_message: Option<String>,
        exhausted: bool,
        duration: Duration,
        resumed_from: Option<u64>,
    ) -> Result<BatchSummary, BatchError> {
        if exhausted {
            let discovered = self.discovered;
            let job = self.store.apply(self.job_id, |job| {
                job.total_items = discovered.max(job.attempted_items());
            })?;
            self.known_total = job.total_items;
        }

        self.save_checkpoint().await;
        let job = self.store.transition(self.job_id, status, error_message)?;
        self.report_progress();

        Ok(BatchSummary {
            job_id: job.id,
            status: job.status,
            processed: job.processed_items,
            failed: job.failed_items,
            total: job.total_items,
            duration,
            retried_items: self.retried_items,
            resumed_from,
            error_message: job.error_message,
            failures: self.failures,
        })
    }

    async fn save_checkpoint(&mut self) -> bool {
        match self.checkpoints.checkpoint(self.known_total).await {
            Ok(saved) => saved,
            Err(e) => {
                // The next boundary retries the save
                warn!(
                    job_id = %self.job_id,
                    offset = self.checkpoints.offset(),
                    error = %e,
                    "failed to save checkpoint"
                );
                false
            }
        }
    }

    fn report_progress(&self) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        match self.store.get(self.job_id) {
            Ok(job) => {
                reporter.report(&ProgressUpdate::from_job(
                    &job,
                    self.checkpoints.last_saved_offset(),
                ));
            }
            Err(e) => warn!(job_id = %self.job_id, error = %e, "cannot report progress"),
        }
    }
}
