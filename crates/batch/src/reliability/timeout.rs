//! Per-item timeout enforcement

use std::future::Future;
use std::time::Duration;

use crate::error::ItemError;
use crate::source::WorkResult;

/// Upper bound on a single attempt
///
/// Independent of any job-wide limit; each retry gets a fresh budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemTimeout {
    limit: Duration,
}

impl ItemTimeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Run one attempt, mapping an elapsed limit to [`ItemError::timeout`]
    pub async fn run<F>(&self, attempt: F) -> WorkResult
    where
        F: Future<Output = WorkResult>,
    {
        match tokio::time::timeout(self.limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ItemError::timeout(self.limit)),
        }
    }
}
