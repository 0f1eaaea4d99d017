//! Batch job orchestration

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, InMemoryCheckpointStore};
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::job::{BatchJob, BatchStatus, BatchSummary, JobId, JobMetadata, JobRecorder, JobStore};
use crate::progress::{ProgressReporter, TracingProgressReporter};
use crate::source::{ItemSource, WorkFn};
use crate::strategy::{self, ExecutionContext, StrategyOutcome};

/// Creates, runs and cancels batch jobs
///
/// # Example
///
/// ```
/// use everruns_batch::{work_fn, BatchConfig, BatchProcessor, BatchStatus, ItemSource, ProcessingMode};
///
/// # tokio_test::block_on(async {
/// let processor = BatchProcessor::in_memory();
/// let config = BatchConfig::builder()
///     .with_processing_mode(ProcessingMode::Concurrent)
///     .build()
///     .unwrap();
///
/// let job_id = processor.create_job(Some(3), config).unwrap();
/// let summary = processor
///     .run(
///         job_id,
///         ItemSource::from_vec(vec![1u32, 2, 3]),
///         work_fn(|_ctx, _n: u32| async { Ok(()) }),
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(summary.status, BatchStatus::Completed);
/// assert_eq!(summary.processed, 3);
/// # });
/// ```
pub struct BatchProcessor {
    jobs: Arc<JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    reporter: Arc<dyn ProgressReporter>,
    cancellations: DashMap<JobId, CancellationToken>,
}

impl BatchProcessor {
    /// Create a processor over injected job and checkpoint stores
    pub fn new(jobs: Arc<JobStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            jobs,
            checkpoints,
            reporter: Arc::new(TracingProgressReporter),
            cancellations: DashMap::new(),
        }
    }

    /// Processor with fresh in-memory stores
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(JobStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    /// Replace the default tracing progress reporter
    pub fn with_progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn job_store(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Register a Pending job with a fresh id
    pub fn create_job(
        &self,
        total_items: Option<u64>,
        config: BatchConfig,
    ) -> Result<JobId, BatchError> {
        self.create_job_with_id(JobId::new(), total_items, config)
    }

    /// Register a Pending job under a known id
    ///
    /// Used to resume a job from its checkpoint after a restart.
    pub fn create_job_with_id(
        &self,
        job_id: JobId,
        total_items: Option<u64>,
        config: BatchConfig,
    ) -> Result<JobId, BatchError> {
        self.register(job_id, total_items, JobMetadata::new(config))
    }

    /// Register a Pending job carrying host-defined tags
    pub fn create_job_with_tags(
        &self,
        total_items: Option<u64>,
        config: BatchConfig,
        tags: BTreeMap<String, String>,
    ) -> Result<JobId, BatchError> {
        self.register(
            JobId::new(),
            total_items,
            JobMetadata::new(config).with_tags(tags),
        )
    }

    fn register(
        &self,
        job_id: JobId,
        total_items: Option<u64>,
        metadata: JobMetadata,
    ) -> Result<JobId, BatchError> {
        metadata.config_snapshot.validate()?;
        let job = self.jobs.create(job_id, total_items, metadata)?;
        info!(
            %job_id,
            mode = %job.config().processing_mode(),
            total_items = ?total_items,
            "batch job created"
        );
        Ok(job_id)
    }

    /// Run a Pending job to a terminal state
    ///
    /// Item failures, fatal aborts and cancellation all produce `Ok(summary)`;
    /// only misuse and checkpoint load failures return an error.
    #[instrument(skip_all, fields(%job_id))]
    pub async fn run<T>(
        &self,
        job_id: JobId,
        items: ItemSource<T>,
        work: WorkFn<T>,
    ) -> Result<BatchSummary, BatchError>
    where
        T: Clone + Send + 'static,
    {
        let job = self.jobs.get(job_id)?;
        match job.status {
            BatchStatus::Pending => {}
            BatchStatus::Running => return Err(BatchError::AlreadyRunning(job_id)),
            from => {
                return Err(BatchError::InvalidTransition {
                    job_id,
                    from,
                    to: BatchStatus::Running,
                })
            }
        }

        let checkpoint = self.checkpoints.load(job_id).await?;

        let cancel = match self.cancellations.entry(job_id) {
            Entry::Occupied(_) => return Err(BatchError::AlreadyRunning(job_id)),
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).clone(),
        };
        if let Err(e) = self.jobs.transition(job_id, BatchStatus::Running, None) {
            self.cancellations.remove(&job_id);
            return Err(e);
        }

        let result = self.execute(job, checkpoint, items, work, cancel).await;
        self.cancellations.remove(&job_id);
        result
    }

    async fn execute<T>(
        &self,
        job: BatchJob,
        checkpoint: Option<Checkpoint>,
        items: ItemSource<T>,
        work: WorkFn<T>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, BatchError>
    where
        T: Clone + Send + 'static,
    {
        let started = Instant::now();
        let job_id = job.id;
        let config = job.config().clone();

        let mut known_total = job.total_items;
        if let Some(len) = items.known_len() {
            if len > known_total {
                known_total = self
                    .jobs
                    .apply(job_id, |job| job.total_items = job.total_items.max(len))?
                    .total_items;
            }
        }

        let reporter = config.progress_tracking().then(|| Arc::clone(&self.reporter));
        let manager = CheckpointManager::new(
            job_id,
            Arc::clone(&self.checkpoints),
            config.checkpoint_interval(),
        );
        let mut recorder = JobRecorder::new(
            Arc::clone(&self.jobs),
            job_id,
            known_total,
            manager,
            reporter,
        );

        let resumed_from = match &checkpoint {
            Some(checkpoint) if checkpoint.offset > 0 => {
                recorder.resume(checkpoint)?;
                Some(checkpoint.offset)
            }
            _ => None,
        };

        info!(
            %job_id,
            mode = %config.processing_mode(),
            total_items = known_total,
            resumed_from = ?resumed_from,
            "batch job started"
        );

        let strategy = strategy::for_mode::<T>(config.processing_mode());
        let stream = items.into_indexed_stream(resumed_from.unwrap_or(0));
        let mut ctx = ExecutionContext::new(config, work, cancel, recorder);
        let outcome = strategy.process(&mut ctx, stream).await;
        let recorder = ctx.into_recorder();

        let (status, error_message, exhausted) = match outcome {
            Ok(StrategyOutcome::Exhausted) => (BatchStatus::Completed, None, true),
            Ok(StrategyOutcome::Cancelled) => (BatchStatus::Cancelled, None, false),
            Ok(StrategyOutcome::Aborted { reason }) => (BatchStatus::Failed, Some(reason), false),
            Err(e) => {
                error!(%job_id, error = %e, "batch job failed");
                if let Err(finish_error) = recorder
                    .finish(
                        BatchStatus::Failed,
                        Some(e.to_string()),
                        false,
                        started.elapsed(),
                        resumed_from,
                    )
                    .await
                {
                    warn!(%job_id, error = %finish_error, "could not mark job failed");
                }
                return Err(e);
            }
        };

        let summary = recorder
            .finish(
                status,
                error_message,
                exhausted,
                started.elapsed(),
                resumed_from,
            )
            .await?;

        info!(
            %job_id,
            status = %summary.status,
            processed = summary.processed,
            failed = summary.failed,
            total = summary.total,
            retried = summary.retried_items,
            duration_ms = summary.duration.as_millis() as u64,
            "batch job finished"
        );
        Ok(summary)
    }

    /// Snapshot of a job
    pub fn get_job(&self, job_id: JobId) -> Result<BatchJob, BatchError> {
        self.jobs.get(job_id)
    }

    /// Snapshot of every job, ordered by id
    pub fn list_jobs(&self) -> Vec<BatchJob> {
        self.jobs.list()
    }

    /// Request cancellation
    ///
    /// A running job stops dispatching and becomes Cancelled once its
    /// in-flight items finish. A pending job is cancelled immediately.
    /// Cancelling a finished job is a no-op. Returns the status at the time
    /// of the call.
    #[instrument(skip(self))]
    pub fn cancel(&self, job_id: JobId) -> Result<BatchStatus, BatchError> {
        if let Some(token) = self.cancellations.get(&job_id) {
            token.cancel();
            info!(%job_id, "cancellation requested");
            return Ok(self.jobs.get(job_id)?.status);
        }

        let job = self.jobs.get(job_id)?;
        match job.status {
            BatchStatus::Pending => {
                let job = self.jobs.transition(job_id, BatchStatus::Cancelled, None)?;
                info!(%job_id, "pending job cancelled");
                Ok(job.status)
            }
            status => Ok(status),
        }
    }

    /// Remove a job that is not running from the job store
    ///
    /// Its checkpoint, if any, stays in the checkpoint store.
    pub fn evict(&self, job_id: JobId) -> Result<BatchJob, BatchError> {
        self.jobs.evict(job_id)
    }
}
