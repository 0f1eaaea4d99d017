//! Batch execution configuration
//!
//! [`BatchConfig`] is validated once when it is built and is immutable
//! afterwards. Jobs keep a snapshot of the config they were created with.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Execution strategy for a batch job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// One item at a time, in source order
    #[default]
    Sequential,

    /// Items dispatched into a bounded worker pool
    Concurrent,

    /// Items pulled lazily in `batch_size` chunks
    Streaming,

    /// Concurrency tuned at checkpoint boundaries from observed errors and latency
    Adaptive,
}

impl ProcessingMode {
    /// All modes, in declaration order
    pub const ALL: [ProcessingMode; 4] = [
        Self::Sequential,
        Self::Concurrent,
        Self::Streaming,
        Self::Adaptive,
    ];
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Concurrent => write!(f, "concurrent"),
            Self::Streaming => write!(f, "streaming"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            "streaming" => Ok(Self::Streaming),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// How the delay between retries grows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `retry_delay × attempt`
    #[default]
    Linear,

    /// `retry_delay × 2^(attempt - 1)`, capped at `max_delay`
    Exponential {
        #[serde(with = "duration_millis")]
        max_delay: Duration,
    },
}

/// Tuning knobs for [`ProcessingMode::Adaptive`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    /// Concurrency the job starts at, and the floor for decreases
    pub min_workers: usize,

    /// Ceiling for increases (`None` = `parallel_workers`)
    pub max_workers: Option<usize>,

    /// Window error rate (0.0-1.0) above which concurrency is decreased
    pub error_rate_threshold: f64,

    /// Average item latency above which concurrency is decreased
    /// (`None` = half of the per-item timeout)
    #[serde(with = "option_duration_millis")]
    pub latency_ceiling: Option<Duration>,

    /// A window whose average latency exceeds the healthy baseline by this
    /// factor counts as a latency spike
    pub latency_spike_factor: f64,

    /// Workers added after a healthy window
    pub increase_step: usize,

    /// Workers removed after an unhealthy window
    pub decrease_step: usize,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: None,
            error_rate_threshold: 0.1,
            latency_ceiling: None,
            latency_spike_factor: 2.0,
            increase_step: 1,
            decrease_step: 1,
        }
    }
}

impl AdaptiveSettings {
    /// Create adaptive settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the starting (and minimum) concurrency
    pub fn with_min_workers(mut self, workers: usize) -> Self {
        self.min_workers = workers;
        self
    }

    /// Set the maximum concurrency
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    /// Set the error-rate threshold (0.0-1.0)
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    /// Set an absolute latency ceiling
    pub fn with_latency_ceiling(mut self, ceiling: Duration) -> Self {
        self.latency_ceiling = Some(ceiling);
        self
    }

    /// Set the relative latency spike factor
    pub fn with_latency_spike_factor(mut self, factor: f64) -> Self {
        self.latency_spike_factor = factor;
        self
    }

    /// Set the additive increase and decrease steps
    pub fn with_steps(mut self, increase: usize, decrease: usize) -> Self {
        self.increase_step = increase;
        self.decrease_step = decrease;
        self
    }

    fn validate(&self, parallel_workers: usize) -> Result<(), ConfigError> {
        let max = self.max_workers.unwrap_or(parallel_workers);
        if self.min_workers == 0 {
            return Err(ConfigError::InvalidAdaptive(
                "min_workers must be at least 1".into(),
            ));
        }
        if max < self.min_workers {
            return Err(ConfigError::InvalidAdaptive(format!(
                "max_workers ({max}) is below min_workers ({})",
                self.min_workers
            )));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(ConfigError::InvalidAdaptive(format!(
                "error_rate_threshold must be within (0.0, 1.0], got {}",
                self.error_rate_threshold
            )));
        }
        if self.latency_ceiling == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidAdaptive(
                "latency_ceiling must be greater than zero".into(),
            ));
        }
        if !self.latency_spike_factor.is_finite() || self.latency_spike_factor < 1.0 {
            return Err(ConfigError::InvalidAdaptive(format!(
                "latency_spike_factor must be at least 1.0, got {}",
                self.latency_spike_factor
            )));
        }
        if self.increase_step == 0 || self.decrease_step == 0 {
            return Err(ConfigError::InvalidAdaptive(
                "increase_step and decrease_step must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Validated, immutable execution parameters for a batch job
///
/// # Example
///
/// ```
/// use everruns_batch::{BatchConfig, ProcessingMode};
/// use std::time::Duration;
///
/// let config = BatchConfig::builder()
///     .with_processing_mode(ProcessingMode::Concurrent)
///     .with_parallel_workers(8)
///     .with_max_retries(2)
///     .with_retry_delay(Duration::from_millis(250))
///     .build()
///     .unwrap();
///
/// assert_eq!(config.parallel_workers(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BatchConfigBuilder")]
pub struct BatchConfig {
    processing_mode: ProcessingMode,
    batch_size: usize,
    max_retries: u32,
    #[serde(with = "duration_millis")]
    retry_delay: Duration,
    #[serde(with = "duration_millis")]
    timeout: Duration,
    checkpoint_interval: usize,
    parallel_workers: usize,
    memory_limit_mb: u64,
    progress_tracking: bool,
    backoff: BackoffStrategy,
    retry_jitter: f64,
    adaptive: AdaptiveSettings,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let defaults = BatchConfigBuilder::default();
        Self {
            processing_mode: defaults.processing_mode,
            batch_size: defaults.batch_size,
            max_retries: defaults.max_retries,
            retry_delay: defaults.retry_delay,
            timeout: defaults.timeout,
            checkpoint_interval: defaults.checkpoint_interval,
            parallel_workers: defaults.parallel_workers,
            memory_limit_mb: defaults.memory_limit_mb,
            progress_tracking: defaults.progress_tracking,
            backoff: defaults.backoff,
            retry_jitter: defaults.retry_jitter,
            adaptive: defaults.adaptive,
        }
    }
}

impl BatchConfig {
    /// Start building a configuration from defaults
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    /// Load configuration from `BATCH_*` environment variables
    ///
    /// Unset variables fall back to defaults; unparsable values are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Some(mode) = env_value::<ProcessingMode>("BATCH_PROCESSING_MODE")? {
            builder = builder.with_processing_mode(mode);
        }
        if let Some(size) = env_value("BATCH_SIZE")? {
            builder = builder.with_batch_size(size);
        }
        if let Some(retries) = env_value("BATCH_MAX_RETRIES")? {
            builder = builder.with_max_retries(retries);
        }
        if let Some(millis) = env_value("BATCH_RETRY_DELAY_MS")? {
            builder = builder.with_retry_delay(Duration::from_millis(millis));
        }
        if let Some(millis) = env_value("BATCH_TIMEOUT_MS")? {
            builder = builder.with_timeout(Duration::from_millis(millis));
        }
        if let Some(interval) = env_value("BATCH_CHECKPOINT_INTERVAL")? {
            builder = builder.with_checkpoint_interval(interval);
        }
        if let Some(workers) = env_value("BATCH_PARALLEL_WORKERS")? {
            builder = builder.with_parallel_workers(workers);
        }
        if let Some(limit) = env_value("BATCH_MEMORY_LIMIT_MB")? {
            builder = builder.with_memory_limit_mb(limit);
        }
        if let Some(enabled) = env_value("BATCH_PROGRESS_TRACKING")? {
            builder = builder.with_progress_tracking(enabled);
        }

        builder.build()
    }

    /// Re-check every bound
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.retry_delay.is_zero() {
            return Err(ConfigError::ZeroRetryDelay);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ZeroCheckpointInterval);
        }
        if self.parallel_workers == 0 {
            return Err(ConfigError::ZeroParallelWorkers);
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::ZeroMemoryLimit);
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::InvalidJitter(self.retry_jitter));
        }
        if let BackoffStrategy::Exponential { max_delay } = self.backoff {
            if max_delay < self.retry_delay {
                return Err(ConfigError::InvalidBackoff(format!(
                    "max_delay ({max_delay:?}) is shorter than retry_delay ({:?})",
                    self.retry_delay
                )));
            }
        }
        self.adaptive.validate(self.parallel_workers)
    }

    /// Stable JSON rendering used for audit logs and job metadata
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing_mode
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Per-item timeout, applied to each attempt
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn checkpoint_interval(&self) -> usize {
        self.checkpoint_interval
    }

    pub fn parallel_workers(&self) -> usize {
        self.parallel_workers
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    pub fn progress_tracking(&self) -> bool {
        self.progress_tracking
    }

    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    pub fn retry_jitter(&self) -> f64 {
        self.retry_jitter
    }

    pub fn adaptive(&self) -> &AdaptiveSettings {
        &self.adaptive
    }
}

/// Builder for [`BatchConfig`]
///
/// Also the deserialization shape, so configs read from JSON are validated
/// the same way as configs built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfigBuilder {
    processing_mode: ProcessingMode,
    batch_size: usize,
    max_retries: u32,
    #[serde(with = "duration_millis")]
    retry_delay: Duration,
    #[serde(with = "duration_millis")]
    timeout: Duration,
    checkpoint_interval: usize,
    parallel_workers: usize,
    memory_limit_mb: u64,
    progress_tracking: bool,
    backoff: BackoffStrategy,
    retry_jitter: f64,
    adaptive: AdaptiveSettings,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::Sequential,
            batch_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            checkpoint_interval: 100,
            parallel_workers: 4,
            memory_limit_mb: 1024,
            progress_tracking: true,
            backoff: BackoffStrategy::Linear,
            retry_jitter: 0.0,
            adaptive: AdaptiveSettings::default(),
        }
    }
}

impl BatchConfigBuilder {
    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers;
        self
    }

    pub fn with_memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = limit;
        self
    }

    pub fn with_progress_tracking(mut self, enabled: bool) -> Self {
        self.progress_tracking = enabled;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Exponential backoff capped at `max_delay`
    pub fn with_exponential_backoff(self, max_delay: Duration) -> Self {
        self.with_backoff(BackoffStrategy::Exponential { max_delay })
    }

    /// Jitter factor (0.0-1.0); 0.1 means ±10% randomness on each delay
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveSettings) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<BatchConfig, ConfigError> {
        let config = BatchConfig {
            processing_mode: self.processing_mode,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
            checkpoint_interval: self.checkpoint_interval,
            parallel_workers: self.parallel_workers,
            memory_limit_mb: self.memory_limit_mb,
            progress_tracking: self.progress_tracking,
            backoff: self.backoff,
            retry_jitter: self.retry_jitter,
            adaptive: self.adaptive,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<BatchConfigBuilder> for BatchConfig {
    type Error = ConfigError;

    fn try_from(builder: BatchConfigBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

fn env_value<V: FromStr>(var: &str) -> Result<Option<V>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
