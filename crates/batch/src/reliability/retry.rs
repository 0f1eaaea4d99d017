//! Per-item retry policy and controller

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::timeout::ItemTimeout;
use crate::config::{duration_millis, BackoffStrategy, BatchConfig};
use crate::error::ItemError;
use crate::job::{ItemResult, JobId};
use crate::source::{ItemContext, WorkFn};

/// How often and how patiently a failing item is retried
///
/// # Example
///
/// ```
/// use everruns_batch::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_retry(5), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay unit for backoff
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy described by a job configuration
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            base_delay: config.retry_delay(),
            backoff: config.backoff(),
            jitter: config.retry_jitter(),
        }
    }

    /// `base_delay × retry`
    pub fn linear(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// `base_delay × 2^(retry - 1)`, capped at `max_delay`
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: BackoffStrategy::Exponential { max_delay },
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self::linear(0, Duration::ZERO)
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Attempts allowed per item, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential { max_delay } => 2u32
                .checked_pow(retry - 1)
                .map(|factor| self.base_delay.saturating_mul(factor))
                .unwrap_or(max_delay)
                .min(max_delay),
        };

        if self.jitter > 0.0 && !delay.is_zero() {
            let secs = delay.as_secs_f64();
            let range = secs * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            Duration::from_secs_f64((secs + offset).max(0.0))
        } else {
            delay
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

/// Runs items through attempts, timeouts and backoff
pub struct RetryController {
    policy: RetryPolicy,
    timeout: ItemTimeout,
    cancel: CancellationToken,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, timeout: ItemTimeout, cancel: CancellationToken) -> Self {
        Self {
            policy,
            timeout,
            cancel,
        }
    }

    pub fn from_config(config: &BatchConfig, cancel: CancellationToken) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            ItemTimeout::new(config.timeout()),
            cancel,
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one item to its final outcome
    ///
    /// Recoverable failures, timeouts and panics are retried until the
    /// policy is exhausted. Fatal errors return immediately. Cancellation
    /// never interrupts a running attempt; an item waiting for its next
    /// attempt comes back as [`ItemOutcome::Interrupted`] instead of failed.
    ///
    /// [`ItemOutcome::Interrupted`]: crate::job::ItemOutcome::Interrupted
    pub async fn execute<T>(&self, job_id: JobId, index: u64, item: T, work: &WorkFn<T>) -> ItemResult
    where
        T: Clone + Send + 'static,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            let ctx = ItemContext {
                job_id,
                index,
                attempt,
                max_attempts,
            };
            let attempt_item = item.clone();
            let call = AssertUnwindSafe(async move { work(ctx, attempt_item).await }).catch_unwind();
            let outcome = self
                .timeout
                .run(async move {
                    call.await.unwrap_or_else(|panic| {
                        Err(ItemError::recoverable(format!(
                            "work function panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
                })
                .await;

            let error = match outcome {
                Ok(()) => return ItemResult::success(index, attempt, started.elapsed()),
                Err(error) => error,
            };

            if error.is_fatal() {
                warn!(
                    job_id = %job_id,
                    index,
                    attempt,
                    error = %error,
                    "item failed with a fatal error"
                );
                return ItemResult::fatal(index, attempt, started.elapsed(), error.message);
            }

            if !self.policy.has_attempts_remaining(attempt) {
                debug!(
                    job_id = %job_id,
                    index,
                    attempts = attempt,
                    error = %error,
                    "item retries exhausted"
                );
                return ItemResult::failed(index, attempt, started.elapsed(), error.message);
            }

            let delay = self.policy.delay_for_retry(attempt);
            debug!(
                job_id = %job_id,
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "item failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(job_id = %job_id, index, attempt, "retry abandoned after cancellation");
                    return ItemResult::interrupted(
                        index,
                        attempt,
                        started.elapsed(),
                        error.message,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ItemOutcome;
    use crate::source::work_fn;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn controller(policy: RetryPolicy) -> RetryController {
        RetryController::new(
            policy,
            ItemTimeout::new(Duration::from_secs(5)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(100));

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1)).with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_attempts_remaining() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(10));
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));

        assert!(!RetryPolicy::no_retry().has_attempts_remaining(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let work = work_fn(move |ctx, _: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt < 3 {
                    Err(ItemError::recoverable("flaky"))
                } else {
                    Ok(())
                }
            }
        });

        let result = controller(RetryPolicy::linear(3, Duration::from_millis(10)))
            .execute(JobId::new(), 7, (), &work)
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.index, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let work = work_fn(move |_, _: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ItemError::recoverable("always down")) }
        });

        let result = controller(RetryPolicy::linear(2, Duration::from_millis(10)))
            .execute(JobId::new(), 0, (), &work)
            .await;

        assert_eq!(
            result.outcome,
            ItemOutcome::RetriedThenFailed {
                attempts: 3,
                reason: "always down".into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let work = work_fn(move |_, _: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ItemError::fatal("corrupt input")) }
        });

        let result = controller(RetryPolicy::linear(5, Duration::from_millis(10)))
            .execute(JobId::new(), 0, (), &work)
            .await;

        assert!(result.is_fatal());
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let work = work_fn(|ctx, _: ()| async move {
            if ctx.attempt == 1 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        });

        let result = controller(RetryPolicy::linear(1, Duration::from_millis(10)))
            .execute(JobId::new(), 0, (), &work)
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let work = work_fn(|_, value: u32| async move {
            if value > 0 {
                panic!("bad value {value}");
            }
            Ok(())
        });

        let result = controller(RetryPolicy::no_retry())
            .execute(JobId::new(), 0, 1, &work)
            .await;

        assert_eq!(
            result.reason(),
            Some("work function panicked: bad value 1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_interrupts_item() {
        let cancel = CancellationToken::new();
        let retry = RetryController::new(
            RetryPolicy::linear(3, Duration::from_millis(300)),
            ItemTimeout::new(Duration::from_secs(5)),
            cancel.clone(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let work = work_fn(move |ctx, _: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if ctx.attempt == 1 {
                    Err(ItemError::recoverable("transient"))
                } else {
                    Ok(())
                }
            }
        });

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = retry.execute(JobId::new(), 0, (), &work).await;

        assert_eq!(
            result.outcome,
            ItemOutcome::Interrupted {
                attempts: 1,
                reason: "transient".into()
            }
        );
        assert!(!result.is_final());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
