//! # Batch Execution Engine
//!
//! Runs a caller-supplied async work function over a large collection of
//! items, with bounded concurrency, per-item retries and timeouts, periodic
//! checkpoints for resumption, progress reporting and cooperative
//! cancellation.
//!
//! ## Features
//!
//! - **Four processing modes**: sequential, concurrent, streaming (chunked
//!   pulls with backpressure) and adaptive (concurrency tuned from observed
//!   errors, latency and memory)
//! - **Retries**: linear or capped exponential backoff with jitter; fatal
//!   errors are never retried and abort the job
//! - **Checkpoints**: contiguous offsets persisted through a pluggable
//!   [`CheckpointStore`]; a rerun resumes where the last checkpoint left off
//! - **Progress**: [`ProgressReporter`] callbacks at checkpoint boundaries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchProcessor                          │
//! │  (job lifecycle, cancellation, checkpoint load on start)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ProcessingStrategy                         │
//! │  (sequential | concurrent | streaming | adaptive)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             WorkerPool + RetryController                     │
//! │  (bounded tasks, timeouts, backoff, panic capture)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          JobRecorder → JobStore / CheckpointStore            │
//! │  (single writer of counters, watermark checkpoints)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use everruns_batch::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let processor = BatchProcessor::in_memory();
//! let config = BatchConfig::builder()
//!     .with_processing_mode(ProcessingMode::Streaming)
//!     .with_batch_size(2)
//!     .with_max_retries(0)
//!     .build()
//!     .unwrap();
//!
//! let job_id = processor.create_job(None, config).unwrap();
//! let summary = processor
//!     .run(
//!         job_id,
//!         ItemSource::from_iter(["a", "b", "", "d"].map(String::from)),
//!         work_fn(|_ctx, text: String| async move {
//!             if text.is_empty() {
//!                 return Err(ItemError::recoverable("empty document"));
//!             }
//!             Ok(())
//!         }),
//!     )
//!     .await
//!     .unwrap();
//!
//! assert_eq!(summary.status, BatchStatus::Completed);
//! assert_eq!(summary.total, 4);
//! # });
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod job;
pub mod processor;
pub mod progress;
pub mod reliability;
pub mod source;
pub mod strategy;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointCounters, CheckpointError, CheckpointStore, InMemoryCheckpointStore};
pub use config::{AdaptiveSettings, BackoffStrategy, BatchConfig, BatchConfigBuilder, ProcessingMode};
pub use error::{BatchError, ConfigError, ItemError, ItemErrorKind};
pub use job::{
    BatchJob, BatchStatus, BatchSummary, ItemFailure, ItemOutcome, ItemResult, JobId, JobMetadata,
    JobStore,
};
pub use processor::BatchProcessor;
pub use progress::{NoopProgressReporter, ProgressReporter, ProgressUpdate, TracingProgressReporter};
pub use reliability::{ItemTimeout, RetryController, RetryPolicy};
pub use source::{work_fn, ItemContext, ItemSource, WorkFn, WorkResult};
pub use strategy::{ProcessingStrategy, StrategyOutcome};
pub use worker::{WorkerPool, WorkerPoolError};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    pub use crate::config::{BatchConfig, ProcessingMode};
    pub use crate::error::{BatchError, ItemError};
    pub use crate::job::{BatchStatus, BatchSummary, JobId, JobStore};
    pub use crate::processor::BatchProcessor;
    pub use crate::progress::ProgressReporter;
    pub use crate::source::{work_fn, ItemContext, ItemSource, WorkResult};
}
