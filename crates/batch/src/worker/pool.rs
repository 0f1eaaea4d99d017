//! Bounded worker pool for item execution
//!
//! Concurrency is capped by a semaphore. `submit` waits for a free permit,
//! so callers get backpressure instead of an unbounded queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::job::{ItemResult, JobId};
use crate::reliability::RetryController;
use crate::source::WorkFn;

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    /// Cancellation observed while waiting for a free worker
    #[error("worker pool cancelled")]
    Cancelled,

    /// The permit semaphore was closed
    #[error("worker pool is closed")]
    Closed,
}

/// Executes items on tokio tasks, at most `capacity` at a time
///
/// Results arrive in completion order through [`next_result`](Self::next_result).
pub struct WorkerPool<T> {
    job_id: JobId,
    work: WorkFn<T>,
    retry: Arc<RetryController>,
    permits: Arc<Semaphore>,
    capacity: usize,
    tasks: JoinSet<()>,
    outstanding: usize,
    results_tx: mpsc::UnboundedSender<ItemResult>,
    results_rx: mpsc::UnboundedReceiver<ItemResult>,
    cancel: CancellationToken,
}

impl<T> WorkerPool<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(
        job_id: JobId,
        capacity: usize,
        work: WorkFn<T>,
        retry: Arc<RetryController>,
        cancel: CancellationToken,
    ) -> Self {
        let capacity = capacity.max(1);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            job_id,
            work,
            retry,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            tasks: JoinSet::new(),
            outstanding: 0,
            results_tx,
            results_rx,
            cancel,
        }
    }

    /// Dispatch one item once a worker is free
    ///
    /// Fails with [`WorkerPoolError::Cancelled`] if cancellation is observed
    /// before a permit is acquired; the item is then not dispatched.
    pub async fn submit(&mut self, index: u64, item: T) -> Result<(), WorkerPoolError> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(WorkerPoolError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| WorkerPoolError::Closed)?
            }
        };

        self.reap_finished();

        let job_id = self.job_id;
        let work = Arc::clone(&self.work);
        let retry = Arc::clone(&self.retry);
        let results = self.results_tx.clone();
        self.outstanding += 1;

        self.tasks.spawn(async move {
            let result = retry.execute(job_id, index, item, &work).await;
            // Release the worker before handing the result back
            drop(permit);
            if results.send(result).is_err() {
                debug!(%job_id, index, "result dropped, pool already closed");
            }
        });
        Ok(())
    }

    /// A completed result, if one is ready
    pub fn try_next_result(&mut self) -> Option<ItemResult> {
        let result = self.results_rx.try_recv().ok()?;
        self.outstanding -= 1;
        Some(result)
    }

    /// Wait for the next completed result
    ///
    /// Returns `None` once every submitted item has been collected.
    pub async fn next_result(&mut self) -> Option<ItemResult> {
        if self.outstanding == 0 {
            return None;
        }
        let result = self.results_rx.recv().await?;
        self.outstanding -= 1;
        Some(result)
    }

    /// Wait for every in-flight item and return the remaining results
    pub async fn drain(&mut self) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(self.outstanding);
        while let Some(result) = self.next_result().await {
            results.push(result);
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %self.job_id, error = %e, "worker task failed");
            }
        }
        results
    }

    /// Change the number of workers
    ///
    /// Shrinking waits until enough workers are idle; callers resize between
    /// fully drained windows so this returns immediately in practice.
    pub async fn resize(&mut self, capacity: usize) -> Result<(), WorkerPoolError> {
        let capacity = capacity.max(1);
        if capacity > self.capacity {
            self.permits.add_permits(capacity - self.capacity);
        } else if capacity < self.capacity {
            let surplus = u32::try_from(self.capacity - capacity).map_err(|_| WorkerPoolError::Closed)?;
            self.permits
                .clone()
                .acquire_many_owned(surplus)
                .await
                .map_err(|_| WorkerPoolError::Closed)?
                .forget();
        }
        debug!(job_id = %self.job_id, from = self.capacity, to = capacity, "worker pool resized");
        self.capacity = capacity;
        Ok(())
    }

    /// Items submitted whose results have not been collected yet
    pub fn in_flight(&self) -> usize {
        self.outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!(job_id = %self.job_id, error = %e, "worker task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ItemError;
    use crate::reliability::{ItemTimeout, RetryPolicy};
    use crate::source::work_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool<T: Clone + Send + 'static>(
        capacity: usize,
        work: WorkFn<T>,
        cancel: CancellationToken,
    ) -> WorkerPool<T> {
        let retry = Arc::new(RetryController::new(
            RetryPolicy::no_retry(),
            ItemTimeout::new(Duration::from_secs(5)),
            cancel.clone(),
        ));
        WorkerPool::new(JobId::new(), capacity, work, retry, cancel)
    }

    #[tokio::test]
    async fn test_runs_all_items() {
        let work = work_fn(|_, value: u64| async move {
            if value == 3 {
                Err(ItemError::recoverable("three"))
            } else {
                Ok(())
            }
        });
        let mut pool = pool(2, work, CancellationToken::new());

        for index in 0..6 {
            pool.submit(index, index).await.unwrap();
        }
        let mut results = pool.drain().await;
        results.sort_by_key(|r| r.index);

        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 5);
        assert!(!results[3].is_success());
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let work = work_fn(move |_, _: ()| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let mut pool = pool(3, work, CancellationToken::new());

        for index in 0..20 {
            pool.submit(index, ()).await.unwrap();
        }
        assert_eq!(pool.drain().await.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_submit_after_cancel() {
        let cancel = CancellationToken::new();
        let work = work_fn(|_, _: ()| async { Ok(()) });
        let mut pool = pool(1, work, cancel.clone());

        cancel.cancel();
        assert_eq!(pool.submit(0, ()).await, Err(WorkerPoolError::Cancelled));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resize() {
        let work = work_fn(|_, _: ()| async { Ok(()) });
        let mut pool = pool(2, work, CancellationToken::new());

        pool.resize(5).await.unwrap();
        assert_eq!(pool.capacity(), 5);
        assert_eq!(pool.available(), 5);

        pool.resize(1).await.unwrap();
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 1);

        pool.resize(0).await.unwrap();
        assert_eq!(pool.capacity(), 1);
    }
}
