//! Error taxonomy for the batch engine
//!
//! - [`ConfigError`] - invalid [`BatchConfig`](crate::BatchConfig), raised at construction
//! - [`BatchError`] - orchestration misuse and setup failures, always surfaced
//! - [`ItemError`] - per-item failures returned by work functions; retried,
//!   aggregated, and never surfaced as a job failure unless classified fatal

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointError;
use crate::job::{BatchStatus, JobId};
use crate::worker::WorkerPoolError;

/// Invalid batch configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("retry_delay must be greater than zero")]
    ZeroRetryDelay,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("checkpoint_interval must be at least 1")]
    ZeroCheckpointInterval,

    #[error("parallel_workers must be at least 1")]
    ZeroParallelWorkers,

    #[error("memory_limit_mb must be greater than zero")]
    ZeroMemoryLimit,

    #[error("retry_jitter must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),

    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),

    #[error("invalid adaptive settings: {0}")]
    InvalidAdaptive(String),

    #[error("unknown processing mode: {0}")]
    UnknownMode(String),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}

/// Errors surfaced by the orchestrator and job store
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A job with this id already exists
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    /// No job with this id
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// `run` invoked on a job that is already running
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    /// Illegal status change, e.g. running a finished job
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// Checkpoint store failure
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Worker pool failure
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] WorkerPoolError),
}

/// Classification of an item failure, chosen by the work function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Transient; the item is retried up to `max_retries` times
    Recoverable,

    /// Non-recoverable; never retried, aborts the whole job
    Fatal,

    /// The attempt exceeded the per-item timeout; retried like `Recoverable`
    Timeout,
}

/// Error returned by a work function for a single item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemError {
    /// Error message
    pub message: String,

    /// Retry classification
    pub kind: ItemErrorKind,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ItemError {
    /// Create a recoverable error
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ItemErrorKind::Recoverable,
            details: None,
        }
    }

    /// Create a fatal error that aborts the job
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ItemErrorKind::Fatal,
            details: None,
        }
    }

    /// Create a timeout error for an attempt that ran past `limit`
    pub fn timeout(limit: Duration) -> Self {
        Self {
            message: format!("item timed out after {limit:?}"),
            kind: ItemErrorKind::Timeout,
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the retry controller may try this item again
    pub fn is_retryable(&self) -> bool {
        self.kind != ItemErrorKind::Fatal
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ItemErrorKind::Fatal
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ItemError {}

impl From<anyhow::Error> for ItemError {
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err.to_string())
    }
}
