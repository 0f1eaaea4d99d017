//! Adaptive concurrency
//!
//! Work proceeds in windows of `checkpoint_interval` items. Each window is
//! drained at its checkpoint boundary and the [`AdaptiveController`] then
//! picks the concurrency for the next window: additive decrease on an error,
//! latency or memory spike, additive increase otherwise. The window after a
//! decrease always holds.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, info};

use super::{ExecutionContext, ProcessingStrategy, Pull, StrategyOutcome};
use crate::config::{BatchConfig, ProcessingMode};
use crate::error::BatchError;
use crate::job::ItemResult;
use crate::worker::WorkerPoolError;

/// Weight of the newest healthy window in the latency baseline
const BASELINE_WEIGHT: f64 = 0.2;

/// Item statistics for one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowStats {
    pub items: u64,

    /// Items that failed or needed more than one attempt
    pub errors: u64,

    pub total_latency: Duration,

    /// Resident memory of this process at the end of the window
    pub memory_bytes: Option<u64>,
}

impl WindowStats {
    pub fn observe(&mut self, result: &ItemResult) {
        if !result.is_final() {
            return;
        }
        self.items += 1;
        if !result.is_success() || result.was_retried() {
            self.errors += 1;
        }
        self.total_latency = self.total_latency.saturating_add(result.latency);
    }

    pub fn error_rate(&self) -> f64 {
        if self.items == 0 {
            0.0
        } else {
            self.errors as f64 / self.items as f64
        }
    }

    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.items) {
            Ok(0) => Duration::ZERO,
            Ok(items) => self.total_latency / items,
            Err(_) => self.total_latency.div_f64(self.items as f64),
        }
    }
}

/// Concurrency decision taken at a window boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase { from: usize, to: usize },
    Decrease { from: usize, to: usize },
    Hold,
}

/// Additive-increase/additive-decrease concurrency controller
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    min: usize,
    max: usize,
    current: usize,
    error_rate_threshold: f64,
    latency_ceiling: Duration,
    latency_spike_factor: f64,
    increase_step: usize,
    decrease_step: usize,
    memory_limit_bytes: u64,
    baseline: Option<Duration>,
    cooling_down: bool,
}

impl AdaptiveController {
    /// Controller for a job configuration, starting at `min_workers`
    pub fn from_config(config: &BatchConfig) -> Self {
        let settings = config.adaptive();
        let max = settings
            .max_workers
            .unwrap_or(config.parallel_workers())
            .max(1);
        let min = settings.min_workers.clamp(1, max);

        Self {
            min,
            max,
            current: min,
            error_rate_threshold: settings.error_rate_threshold,
            latency_ceiling: settings.latency_ceiling.unwrap_or(config.timeout() / 2),
            latency_spike_factor: settings.latency_spike_factor,
            increase_step: settings.increase_step.max(1),
            decrease_step: settings.decrease_step.max(1),
            memory_limit_bytes: config.memory_limit_mb().saturating_mul(1024 * 1024),
            baseline: None,
            cooling_down: false,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.current
    }

    /// Healthy-window average latency
    pub fn baseline(&self) -> Option<Duration> {
        self.baseline
    }

    /// Decide the concurrency for the next window
    pub fn observe(&mut self, stats: &WindowStats) -> Adjustment {
        if stats.items == 0 {
            return Adjustment::Hold;
        }

        if self.is_spike(stats) {
            self.cooling_down = true;
            let from = self.current;
            let to = from.saturating_sub(self.decrease_step).max(self.min);
            if to == from {
                return Adjustment::Hold;
            }
            self.current = to;
            return Adjustment::Decrease { from, to };
        }

        let latency = stats.average_latency();
        self.baseline = Some(match self.baseline {
            None => latency,
            Some(baseline) => {
                baseline.mul_f64(1.0 - BASELINE_WEIGHT) + latency.mul_f64(BASELINE_WEIGHT)
            }
        });

        if self.cooling_down {
            self.cooling_down = false;
            return Adjustment::Hold;
        }

        let from = self.current;
        let to = from.saturating_add(self.increase_step).min(self.max);
        if to == from {
            return Adjustment::Hold;
        }
        self.current = to;
        Adjustment::Increase { from, to }
    }

    fn is_spike(&self, stats: &WindowStats) -> bool {
        let latency = stats.average_latency();
        let relative_spike = self
            .baseline
            .is_some_and(|baseline| latency > baseline.mul_f64(self.latency_spike_factor));
        let memory_spike = stats
            .memory_bytes
            .is_some_and(|bytes| bytes >= self.memory_limit_bytes);

        stats.error_rate() > self.error_rate_threshold
            || latency > self.latency_ceiling
            || relative_spike
            || memory_spike
    }
}

/// Samples the resident memory of the current process
pub struct MemoryProbe {
    pid: Pid,
    system: System,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self { pid, system }
    }

    /// Resident memory in bytes, if the process could be inspected
    pub fn sample(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(self.pid).map(|process| process.memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Windows of `checkpoint_interval` items with concurrency tuned between them
#[derive(Debug, Default, Clone, Copy)]
pub struct AdaptiveStrategy;

#[async_trait]
impl<T> ProcessingStrategy<T> for AdaptiveStrategy
where
    T: Clone + Send + 'static,
{
    fn mode(&self) -> ProcessingMode {
        ProcessingMode::Adaptive
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext<T>,
        mut items: BoxStream<'static, (u64, T)>,
    ) -> Result<StrategyOutcome, BatchError> {
        let window = ctx.config().checkpoint_interval();
        let mut controller = AdaptiveController::from_config(ctx.config());
        let mut probe = MemoryProbe::new();
        let mut pool = ctx.worker_pool(controller.concurrency());

        info!(
            job_id = %ctx.job_id(),
            concurrency = controller.concurrency(),
            window,
            "adaptive processing started"
        );

        let exhausted = loop {
            let mut stats = WindowStats::default();
            let mut dispatched = 0;
            let mut finished = None;

            while dispatched < window {
                while let Some(result) = pool.try_next_result() {
                    stats.observe(&result);
                    ctx.record(&result).await?;
                }

                match ctx.pull(&mut items).await {
                    Pull::Item(index, item) => match pool.submit(index, item).await {
                        Ok(()) => {
                            ctx.observe_dispatch(index)?;
                            dispatched += 1;
                        }
                        Err(WorkerPoolError::Cancelled) => {
                            finished = Some(false);
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    },
                    Pull::Exhausted => {
                        finished = Some(true);
                        break;
                    }
                    Pull::Stopped => {
                        finished = Some(false);
                        break;
                    }
                }
            }

            while let Some(result) = pool.next_result().await {
                stats.observe(&result);
                ctx.record(&result).await?;
            }
            ctx.checkpoint_boundary().await;

            if let Some(exhausted) = finished {
                break exhausted;
            }

            stats.memory_bytes = probe.sample();
            let adjustment = controller.observe(&stats);
            debug!(
                job_id = %ctx.job_id(),
                items = stats.items,
                error_rate = stats.error_rate(),
                avg_latency_ms = stats.average_latency().as_millis() as u64,
                memory_bytes = ?stats.memory_bytes,
                "adaptive window complete"
            );

            match adjustment {
                Adjustment::Increase { from, to } | Adjustment::Decrease { from, to } => {
                    info!(job_id = %ctx.job_id(), from, to, "adjusting concurrency");
                    pool.resize(to).await?;
                }
                Adjustment::Hold => {}
            }
        };

        ctx.drain_pool(&mut pool).await?;
        Ok(ctx.outcome(exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptiveSettings;

    fn config(workers: usize) -> BatchConfig {
        BatchConfig::builder()
            .with_processing_mode(ProcessingMode::Adaptive)
            .with_parallel_workers(workers)
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    fn window(items: u64, errors: u64, latency: Duration) -> WindowStats {
        WindowStats {
            items,
            errors,
            total_latency: latency * items as u32,
            memory_bytes: None,
        }
    }

    #[test]
    fn test_window_stats() {
        let mut stats = WindowStats::default();
        stats.observe(&ItemResult::success(0, 1, Duration::from_millis(10)));
        stats.observe(&ItemResult::success(1, 2, Duration::from_millis(30)));
        stats.observe(&ItemResult::failed(2, 1, Duration::from_millis(20), "x"));
        stats.observe(&ItemResult::success(3, 1, Duration::from_millis(20)));
        stats.observe(&ItemResult::interrupted(4, 1, Duration::from_millis(90), "x"));

        assert_eq!(stats.items, 4);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.error_rate(), 0.5);
        assert_eq!(stats.average_latency(), Duration::from_millis(20));
    }

    #[test]
    fn test_defaults_from_config() {
        let controller = AdaptiveController::from_config(&config(6));
        assert_eq!(controller.concurrency(), 1);
        assert_eq!(controller.max, 6);
        assert_eq!(controller.latency_ceiling, Duration::from_secs(1));
    }

    #[test]
    fn test_increases_up_to_max() {
        let mut controller = AdaptiveController::from_config(&config(3));
        let healthy = window(10, 0, Duration::from_millis(10));

        assert_eq!(
            controller.observe(&healthy),
            Adjustment::Increase { from: 1, to: 2 }
        );
        assert_eq!(
            controller.observe(&healthy),
            Adjustment::Increase { from: 2, to: 3 }
        );
        assert_eq!(controller.observe(&healthy), Adjustment::Hold);
        assert_eq!(controller.concurrency(), 3);
    }

    #[test]
    fn test_error_spike_decreases_then_holds() {
        let mut controller = AdaptiveController::from_config(&config(4));
        let healthy = window(10, 0, Duration::from_millis(10));
        let failing = window(10, 5, Duration::from_millis(10));

        controller.observe(&healthy);
        controller.observe(&healthy);
        assert_eq!(controller.concurrency(), 3);

        assert_eq!(
            controller.observe(&failing),
            Adjustment::Decrease { from: 3, to: 2 }
        );
        // The window right after a decrease never increases
        assert_eq!(controller.observe(&healthy), Adjustment::Hold);
        assert_eq!(
            controller.observe(&healthy),
            Adjustment::Increase { from: 2, to: 3 }
        );
    }

    #[test]
    fn test_never_below_min() {
        let config = BatchConfig::builder()
            .with_parallel_workers(4)
            .with_adaptive(AdaptiveSettings::new().with_min_workers(2))
            .build()
            .unwrap();
        let mut controller = AdaptiveController::from_config(&config);
        let failing = window(10, 10, Duration::from_millis(10));

        assert_eq!(controller.observe(&failing), Adjustment::Hold);
        assert_eq!(controller.concurrency(), 2);
    }

    #[test]
    fn test_latency_spikes() {
        let mut controller = AdaptiveController::from_config(&config(4));

        controller.observe(&window(10, 0, Duration::from_millis(100)));
        assert_eq!(controller.baseline(), Some(Duration::from_millis(100)));
        assert_eq!(controller.concurrency(), 2);

        // Three times the baseline
        assert_eq!(
            controller.observe(&window(10, 0, Duration::from_millis(300))),
            Adjustment::Decrease { from: 2, to: 1 }
        );

        // Above the absolute ceiling (half of the 2s timeout)
        let mut controller = AdaptiveController::from_config(&config(4));
        controller.observe(&window(10, 0, Duration::from_millis(10)));
        assert!(matches!(
            controller.observe(&window(10, 0, Duration::from_millis(1500))),
            Adjustment::Decrease { .. }
        ));
    }

    #[test]
    fn test_memory_spike() {
        let mut controller = AdaptiveController::from_config(&config(4));
        controller.observe(&window(10, 0, Duration::from_millis(10)));

        let mut stats = window(10, 0, Duration::from_millis(10));
        stats.memory_bytes = Some(2048 * 1024 * 1024);
        assert_eq!(
            controller.observe(&stats),
            Adjustment::Decrease { from: 2, to: 1 }
        );
    }

    #[test]
    fn test_memory_probe_samples_current_process() {
        let mut probe = MemoryProbe::new();
        assert!(probe.sample().is_some_and(|bytes| bytes > 0));
    }
}
