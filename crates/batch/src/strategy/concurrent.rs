use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{ExecutionContext, ProcessingStrategy, Pull, StrategyOutcome};
use crate::config::ProcessingMode;
use crate::error::BatchError;
use crate::worker::WorkerPoolError;

/// Items dispatched into a pool of `parallel_workers`
///
/// Item failures only count against `failed_items`; a fatal error stops
/// dispatch and the pool is drained before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrentStrategy;

#[async_trait]
impl<T> ProcessingStrategy<T> for ConcurrentStrategy
where
    T: Clone + Send + 'static,
{
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Concurrent
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext<T>,
        mut items: BoxStream<'static, (u64, T)>,
    ) -> Result<StrategyOutcome, BatchError> {
        let mut pool = ctx.worker_pool(ctx.config().parallel_workers());

        let exhausted = loop {
            ctx.record_ready(&mut pool).await?;

            match ctx.pull(&mut items).await {
                Pull::Item(index, item) => match pool.submit(index, item).await {
                    Ok(()) => ctx.observe_dispatch(index)?,
                    Err(WorkerPoolError::Cancelled) => break false,
                    Err(e) => return Err(e.into()),
                },
                Pull::Exhausted => break true,
                Pull::Stopped => break false,
            }
        };

        ctx.drain_pool(&mut pool).await?;
        Ok(ctx.outcome(exhausted))
    }
}
