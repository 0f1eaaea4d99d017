//! Processing strategies
//!
//! One [`ProcessingStrategy`] per [`ProcessingMode`]. A strategy decides how
//! items are pulled and dispatched; everything it learns goes through the
//! shared [`ExecutionContext`], which owns the job's recorder.

mod adaptive;
mod concurrent;
mod sequential;
mod streaming;

pub use adaptive::{AdaptiveController, AdaptiveStrategy, Adjustment, MemoryProbe, WindowStats};
pub use concurrent::ConcurrentStrategy;
pub use sequential::SequentialStrategy;
pub use streaming::StreamingStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::error;

use crate::config::{BatchConfig, ProcessingMode};
use crate::error::BatchError;
use crate::job::{ItemResult, JobId, JobRecorder};
use crate::reliability::RetryController;
use crate::source::WorkFn;
use crate::worker::WorkerPool;

/// How a strategy run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The source ran dry and every dispatched item was recorded
    Exhausted,

    /// Cancellation was observed; in-flight items were drained
    Cancelled,

    /// A fatal item error stopped dispatch
    Aborted { reason: String },
}

/// Dispatch policy for a [`ProcessingMode`]
#[async_trait]
pub trait ProcessingStrategy<T>: Send + Sync
where
    T: Clone + Send + 'static,
{
    fn mode(&self) -> ProcessingMode;

    /// Pull items from `items`, run them and record every result
    async fn process(
        &self,
        ctx: &mut ExecutionContext<T>,
        items: BoxStream<'static, (u64, T)>,
    ) -> Result<StrategyOutcome, BatchError>;
}

/// Strategy implementing `mode`
pub fn for_mode<T>(mode: ProcessingMode) -> Box<dyn ProcessingStrategy<T>>
where
    T: Clone + Send + 'static,
{
    match mode {
        ProcessingMode::Sequential => Box::new(SequentialStrategy),
        ProcessingMode::Concurrent => Box::new(ConcurrentStrategy),
        ProcessingMode::Streaming => Box::new(StreamingStrategy),
        ProcessingMode::Adaptive => Box::new(AdaptiveStrategy),
    }
}

/// Result of pulling the next item
pub(crate) enum Pull<T> {
    Item(u64, T),
    Exhausted,
    Stopped,
}

/// State shared by a strategy run
pub struct ExecutionContext<T> {
    job_id: JobId,
    config: BatchConfig,
    work: WorkFn<T>,
    retry: Arc<RetryController>,
    cancel: CancellationToken,
    recorder: JobRecorder,
    fatal: Option<String>,
}

impl<T> ExecutionContext<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(
        config: BatchConfig,
        work: WorkFn<T>,
        cancel: CancellationToken,
        recorder: JobRecorder,
    ) -> Self {
        let retry = Arc::new(RetryController::from_config(&config, cancel.clone()));
        Self {
            job_id: recorder.job_id(),
            config,
            work,
            retry,
            cancel,
            recorder,
            fatal: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Reason of the first fatal item error, if any
    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// No further items may be dispatched
    pub fn should_stop(&self) -> bool {
        self.fatal.is_some() || self.is_cancelled()
    }

    /// A pool sharing this run's work function, retry controller and token
    pub fn worker_pool(&self, capacity: usize) -> WorkerPool<T> {
        WorkerPool::new(
            self.job_id,
            capacity,
            Arc::clone(&self.work),
            Arc::clone(&self.retry),
            self.cancel.clone(),
        )
    }

    /// Run one item inline on the calling task
    pub async fn execute_item(&self, index: u64, item: T) -> ItemResult {
        self.retry.execute(self.job_id, index, item, &self.work).await
    }

    /// Next item, unless dispatch must stop first
    pub(crate) async fn pull(&self, items: &mut BoxStream<'static, (u64, T)>) -> Pull<T> {
        if self.should_stop() {
            return Pull::Stopped;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Pull::Stopped,
            next = items.next() => match next {
                Some((index, item)) => Pull::Item(index, item),
                None => Pull::Exhausted,
            },
        }
    }

    pub(crate) fn observe_dispatch(&mut self, index: u64) -> Result<(), BatchError> {
        self.recorder.observe_dispatch(index)
    }

    /// Record one result; a fatal result stops further dispatch
    pub async fn record(&mut self, result: &ItemResult) -> Result<(), BatchError> {
        self.recorder.record(result).await?;
        if result.is_fatal() && self.fatal.is_none() {
            let reason = format!(
                "item {} failed fatally: {}",
                result.index,
                result.reason().unwrap_or("unknown error")
            );
            error!(job_id = %self.job_id, index = result.index, "{reason}");
            self.fatal = Some(reason);
        }
        Ok(())
    }

    /// Record every result that is already available
    pub async fn record_ready(&mut self, pool: &mut WorkerPool<T>) -> Result<(), BatchError> {
        while let Some(result) = pool.try_next_result() {
            self.record(&result).await?;
        }
        Ok(())
    }

    /// Wait for the pool to go idle, recording each result
    pub async fn drain_pool(&mut self, pool: &mut WorkerPool<T>) -> Result<(), BatchError> {
        while let Some(result) = pool.next_result().await {
            self.record(&result).await?;
        }
        for result in pool.drain().await {
            self.record(&result).await?;
        }
        Ok(())
    }

    /// Persist a checkpoint and report progress
    pub async fn checkpoint_boundary(&mut self) {
        self.recorder.checkpoint_boundary().await;
    }

    /// Outcome given whether the source was exhausted
    pub fn outcome(&self, exhausted: bool) -> StrategyOutcome {
        if let Some(reason) = &self.fatal {
            StrategyOutcome::Aborted {
                reason: reason.clone(),
            }
        } else if exhausted {
            StrategyOutcome::Exhausted
        } else if self.is_cancelled() {
            StrategyOutcome::Cancelled
        } else {
            StrategyOutcome::Exhausted
        }
    }

    pub(crate) fn into_recorder(self) -> JobRecorder {
        self.recorder
    }
}
