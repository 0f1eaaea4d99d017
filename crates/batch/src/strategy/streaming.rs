use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;

use super::{ExecutionContext, ProcessingStrategy, StrategyOutcome};
use crate::config::ProcessingMode;
use crate::error::BatchError;
use crate::worker::WorkerPoolError;

/// Items pulled in `batch_size` chunks
///
/// The next chunk is requested only once the current one has completed, so
/// at most one chunk is held in memory and unbounded sources are fine. A
/// checkpoint is taken after every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingStrategy;

#[async_trait]
impl<T> ProcessingStrategy<T> for StreamingStrategy
where
    T: Clone + Send + 'static,
{
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Streaming
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext<T>,
        items: BoxStream<'static, (u64, T)>,
    ) -> Result<StrategyOutcome, BatchError> {
        let mut chunks = items.chunks(ctx.config().batch_size());
        let mut pool = ctx.worker_pool(ctx.config().parallel_workers());

        let exhausted = loop {
            if ctx.should_stop() {
                break false;
            }

            let chunk = tokio::select! {
                biased;
                _ = ctx.cancelled() => break false,
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break true;
            };
            debug!(job_id = %ctx.job_id(), size = chunk.len(), "processing chunk");

            for (index, item) in chunk {
                if ctx.should_stop() {
                    break;
                }
                match pool.submit(index, item).await {
                    Ok(()) => ctx.observe_dispatch(index)?,
                    Err(WorkerPoolError::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                }
                ctx.record_ready(&mut pool).await?;
            }

            ctx.drain_pool(&mut pool).await?;
            ctx.checkpoint_boundary().await;
        };

        ctx.drain_pool(&mut pool).await?;
        Ok(ctx.outcome(exhausted))
    }
}
