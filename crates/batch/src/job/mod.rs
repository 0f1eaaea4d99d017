//! Batch job records
//!
//! This module provides:
//! - [`BatchJob`] and its status machine ([`BatchStatus`])
//! - [`JobStore`], the injected registry of jobs
//! - Per-item results and the run [`BatchSummary`]
//! - `JobRecorder`, the single writer of a running job's counters

mod model;
mod recorder;
mod store;

pub use model::{
    BatchJob, BatchStatus, BatchSummary, ItemFailure, ItemOutcome, ItemResult, JobId, JobMetadata,
};
pub(crate) use recorder::JobRecorder;
pub use recorder::MAX_RETAINED_FAILURES;
pub use store::JobStore;
