use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{ExecutionContext, ProcessingStrategy, Pull, StrategyOutcome};
use crate::config::ProcessingMode;
use crate::error::BatchError;

/// One item at a time, in source order, on the orchestrating task
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialStrategy;

#[async_trait]
impl<T> ProcessingStrategy<T> for SequentialStrategy
where
    T: Clone + Send + 'static,
{
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Sequential
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext<T>,
        mut items: BoxStream<'static, (u64, T)>,
    ) -> Result<StrategyOutcome, BatchError> {
        loop {
            match ctx.pull(&mut items).await {
                Pull::Item(index, item) => {
                    ctx.observe_dispatch(index)?;
                    let result = ctx.execute_item(index, item).await;
                    ctx.record(&result).await?;
                }
                Pull::Exhausted => return Ok(ctx.outcome(true)),
                Pull::Stopped => return Ok(ctx.outcome(false)),
            }
        }
    }
}
