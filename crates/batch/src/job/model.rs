//! Job state records

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{duration_millis, BatchConfig};

/// Unique job identifier (UUID v7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Job created but not started
    Pending,

    /// Items are being dispatched
    Running,

    /// Every item was attempted
    Completed,

    /// A fatal error aborted the job
    Failed,

    /// Cancellation was honoured
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending → Running → {Completed | Failed | Cancelled}; a pending job
    /// may also be cancelled before it runs.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Typed job metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// The configuration the job was created with
    pub config_snapshot: BatchConfig,

    /// Free-form labels supplied by the host (e.g. `kind=reembed`)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl JobMetadata {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config_snapshot: config,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Per-job state record
///
/// Values handed out by the [`JobStore`](super::JobStore) are snapshots;
/// changing them has no effect on the stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Known item count; grows as a lazy source is discovered
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub metadata: JobMetadata,
}

impl BatchJob {
    pub(crate) fn new(id: JobId, total_items: Option<u64>, metadata: JobMetadata) -> Self {
        Self {
            id,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_items: total_items.unwrap_or(0),
            processed_items: 0,
            failed_items: 0,
            progress_percentage: 0.0,
            error_message: None,
            metadata,
        }
    }

    /// Items attempted so far, successful or not
    pub fn attempted_items(&self) -> u64 {
        self.processed_items + self.failed_items
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.metadata.config_snapshot
    }

    pub(crate) fn recompute_progress(&mut self) {
        // Never report fewer items than were attempted
        self.total_items = self.total_items.max(self.attempted_items());
        self.progress_percentage = if self.total_items == 0 {
            if self.status == BatchStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            self.attempted_items() as f64 / self.total_items as f64 * 100.0
        };
    }
}

/// Final outcome of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,

    /// Failed on its only attempt
    Failure { reason: String },

    /// Failed after exhausting its retries
    RetriedThenFailed { attempts: u32, reason: String },

    /// Caller-classified fatal error; aborts the job
    Fatal { reason: String },

    /// Cancelled while waiting for a retry; not counted, retried on resume
    Interrupted { attempts: u32, reason: String },
}

/// Result of running one item through the retry controller
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    /// Stable position of the item in the source
    pub index: u64,

    /// Attempts made, including the first
    pub attempts: u32,

    /// Wall time across all attempts and backoff delays
    pub latency: Duration,

    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn success(index: u64, attempts: u32, latency: Duration) -> Self {
        Self {
            index,
            attempts,
            latency,
            outcome: ItemOutcome::Success,
        }
    }

    /// A non-fatal failure after `attempts` tries
    pub fn failed(index: u64, attempts: u32, latency: Duration, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let outcome = if attempts > 1 {
            ItemOutcome::RetriedThenFailed { attempts, reason }
        } else {
            ItemOutcome::Failure { reason }
        };
        Self {
            index,
            attempts,
            latency,
            outcome,
        }
    }

    pub fn fatal(index: u64, attempts: u32, latency: Duration, reason: impl Into<String>) -> Self {
        Self {
            index,
            attempts,
            latency,
            outcome: ItemOutcome::Fatal {
                reason: reason.into(),
            },
        }
    }

    /// Cancellation cut the item's retries short
    pub fn interrupted(
        index: u64,
        attempts: u32,
        latency: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            index,
            attempts,
            latency,
            outcome: ItemOutcome::Interrupted {
                attempts,
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ItemOutcome::Success
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Fatal { .. })
    }

    /// Whether the result settles the item; interrupted items are left for a later run
    pub fn is_final(&self) -> bool {
        !matches!(self.outcome, ItemOutcome::Interrupted { .. })
    }

    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Failure reason, if the item did not succeed
    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            ItemOutcome::Success => None,
            ItemOutcome::Failure { reason }
            | ItemOutcome::RetriedThenFailed { reason, .. }
            | ItemOutcome::Fatal { reason }
            | ItemOutcome::Interrupted { reason, .. } => Some(reason),
        }
    }
}

/// A failed item retained in the job summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: u64,
    pub attempts: u32,
    pub reason: String,
}

/// Structured result of [`BatchProcessor::run`](crate::BatchProcessor::run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub job_id: JobId,
    pub status: BatchStatus,
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Items that needed more than one attempt in this run
    pub retried_items: u64,
    /// Checkpoint offset this run resumed from
    pub resumed_from: Option<u64>,
    pub error_message: Option<String>,
    /// Retained item failures (bounded)
    pub failures: Vec<ItemFailure>,
}

impl BatchSummary {
    pub fn attempted(&self) -> u64 {
        self.processed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use BatchStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(BatchStatus::Pending.to_string(), "pending");
        assert_eq!(BatchStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_progress_recomputation() {
        let mut job = BatchJob::new(
            JobId::new(),
            Some(200),
            JobMetadata::new(BatchConfig::default()),
        );
        job.processed_items = 45;
        job.failed_items = 5;
        job.recompute_progress();
        assert_eq!(job.progress_percentage, 25.0);

        // Attempted items beyond the declared total raise the total
        job.processed_items = 210;
        job.recompute_progress();
        assert_eq!(job.total_items, 215);
        assert_eq!(job.progress_percentage, 100.0);
    }

    #[test]
    fn test_empty_job_progress() {
        let mut job = BatchJob::new(JobId::new(), None, JobMetadata::new(BatchConfig::default()));
        job.recompute_progress();
        assert_eq!(job.progress_percentage, 0.0);

        job.status = BatchStatus::Completed;
        job.recompute_progress();
        assert_eq!(job.progress_percentage, 100.0);
    }

    #[test]
    fn test_item_result_classification() {
        let ok = ItemResult::success(3, 2, Duration::from_millis(5));
        assert!(ok.is_success());
        assert!(ok.was_retried());
        assert_eq!(ok.reason(), None);

        let once = ItemResult::failed(4, 1, Duration::ZERO, "boom");
        assert_eq!(
            once.outcome,
            ItemOutcome::Failure {
                reason: "boom".into()
            }
        );

        let exhausted = ItemResult::failed(5, 3, Duration::ZERO, "boom");
        assert_eq!(
            exhausted.outcome,
            ItemOutcome::RetriedThenFailed {
                attempts: 3,
                reason: "boom".into()
            }
        );

        let fatal = ItemResult::fatal(6, 1, Duration::ZERO, "schema mismatch");
        assert!(fatal.is_fatal());
        assert!(fatal.is_final());
        assert_eq!(fatal.reason(), Some("schema mismatch"));

        let interrupted = ItemResult::interrupted(7, 1, Duration::ZERO, "transient");
        assert!(!interrupted.is_final());
        assert!(!interrupted.is_success());
        assert!(!interrupted.is_fatal());
    }

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{id}\""));
    }
}
