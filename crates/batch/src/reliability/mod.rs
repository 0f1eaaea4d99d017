//! Reliability for item execution
//!
//! This module provides:
//! - [`RetryPolicy`] - backoff and retry limits derived from the job config
//! - [`RetryController`] - runs an item through attempts until a final outcome
//! - [`ItemTimeout`] - per-attempt timeout

mod retry;
mod timeout;

pub use retry::{RetryController, RetryPolicy};
pub use timeout::ItemTimeout;
