//! Item sources and work functions

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::ItemError;
use crate::job::JobId;

/// Context passed to the work function with each attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContext {
    pub job_id: JobId,

    /// Stable position of the item in its source
    pub index: u64,

    /// Attempt number (1-indexed)
    pub attempt: u32,

    /// Attempts allowed for this item (`max_retries + 1`)
    pub max_attempts: u32,
}

impl ItemContext {
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of one work function call
pub type WorkResult = Result<(), ItemError>;

/// Per-item work function
///
/// Called concurrently from worker tasks, possibly several times for the
/// same item when it is retried.
pub type WorkFn<T> = Arc<dyn Fn(ItemContext, T) -> BoxFuture<'static, WorkResult> + Send + Sync>;

/// Wrap an async closure as a [`WorkFn`]
///
/// # Example
///
/// ```
/// use everruns_batch::{work_fn, ItemError};
///
/// let work = work_fn(|ctx, text: String| async move {
///     if text.is_empty() {
///         return Err(ItemError::fatal(format!("item {} is empty", ctx.index)));
///     }
///     Ok(())
/// });
/// # let _ = work;
/// ```
pub fn work_fn<T, F, Fut>(f: F) -> WorkFn<T>
where
    F: Fn(ItemContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(move |ctx: ItemContext, item: T| -> BoxFuture<'static, WorkResult> {
        Box::pin(f(ctx, item))
    })
}

/// Where a job's items come from
///
/// A materialized source knows its length up front. A lazy source is pulled
/// on demand and may be unbounded; its end of stream marks the end of input.
pub enum ItemSource<T> {
    Materialized(Vec<T>),
    Lazy(BoxStream<'static, T>),
}

impl<T: Send + 'static> ItemSource<T> {
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::Materialized(items)
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Self::Materialized(items.into_iter().collect())
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::Lazy(stream.boxed())
    }

    /// Item count, when known before pulling
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Self::Materialized(items) => Some(items.len() as u64),
            Self::Lazy(_) => None,
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }

    /// Index every item and skip the ones below `offset`
    pub(crate) fn into_indexed_stream(self, offset: u64) -> BoxStream<'static, (u64, T)> {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        match self {
            Self::Materialized(items) => stream::iter(
                items
                    .into_iter()
                    .enumerate()
                    .skip(skip)
                    .map(|(index, item)| (index as u64, item)),
            )
            .boxed(),
            Self::Lazy(items) => items
                .enumerate()
                .skip(skip)
                .map(|(index, item)| (index as u64, item))
                .boxed(),
        }
    }
}

impl<T> fmt::Debug for ItemSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Materialized(items) => f
                .debug_struct("Materialized")
                .field("len", &items.len())
                .finish(),
            Self::Lazy(_) => f.debug_struct("Lazy").finish_non_exhaustive(),
        }
    }
}

impl<T> From<Vec<T>> for ItemSource<T> {
    fn from(items: Vec<T>) -> Self {
        Self::Materialized(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_materialized_source() {
        let source = ItemSource::from_vec(vec!["a", "b", "c"]);
        assert_eq!(source.known_len(), Some(3));
        assert!(!source.is_lazy());

        let items: Vec<(u64, &str)> = source.into_indexed_stream(0).collect().await;
        assert_eq!(items, vec![(0, "a"), (1, "b"), (2, "c")]);
    }

    #[tokio::test]
    async fn test_offset_skips_attempted_items() {
        let source = ItemSource::from_iter(0..10u32);
        let items: Vec<(u64, u32)> = source.into_indexed_stream(7).collect().await;
        assert_eq!(items, vec![(7, 7), (8, 8), (9, 9)]);
    }

    #[tokio::test]
    async fn test_lazy_source_keeps_stable_indices() {
        let source = ItemSource::from_stream(stream::iter(100..105u32));
        assert!(source.is_lazy());
        assert_eq!(source.known_len(), None);

        let items: Vec<(u64, u32)> = source.into_indexed_stream(3).collect().await;
        assert_eq!(items, vec![(3, 103), (4, 104)]);
    }

    #[tokio::test]
    async fn test_work_fn_wraps_closure() {
        let work = work_fn(|ctx, value: u32| async move {
            if value % 2 == 0 {
                Ok(())
            } else {
                Err(ItemError::recoverable(format!("odd at {}", ctx.index)))
            }
        });
        let ctx = ItemContext {
            job_id: JobId::new(),
            index: 1,
            attempt: 1,
            max_attempts: 1,
        };

        assert!(work(ctx, 2).await.is_ok());
        assert_eq!(work(ctx, 3).await.unwrap_err().message, "odd at 1");
        assert!(ctx.is_last_attempt());
        assert!(!ctx.is_retry());
    }
}
