//! Contiguous watermark tracking and periodic checkpoint saves

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::store::{Checkpoint, CheckpointCounters, CheckpointError, CheckpointStore};
use crate::job::JobId;

/// Tracks which items have been attempted and when to persist a checkpoint
///
/// Items may finish out of order. Results ahead of the watermark are parked
/// until every lower index has been attempted, so a checkpoint offset always
/// means "everything below has been attempted" and its counters cover exactly
/// those items.
pub(crate) struct CheckpointManager {
    job_id: JobId,
    store: Arc<dyn CheckpointStore>,
    interval: usize,
    watermark: u64,
    parked: BTreeMap<u64, bool>,
    committed: CheckpointCounters,
    since_last: usize,
    last_saved_offset: Option<u64>,
}

impl CheckpointManager {
    pub(crate) fn new(job_id: JobId, store: Arc<dyn CheckpointStore>, interval: usize) -> Self {
        Self {
            job_id,
            store,
            interval: interval.max(1),
            watermark: 0,
            parked: BTreeMap::new(),
            committed: CheckpointCounters::default(),
            since_last: 0,
            last_saved_offset: None,
        }
    }

    /// Continue from a previously saved checkpoint
    pub(crate) fn resume_from(&mut self, checkpoint: &Checkpoint) {
        self.watermark = checkpoint.offset;
        self.parked.clear();
        self.committed = checkpoint.counters;
        self.since_last = 0;
        self.last_saved_offset = Some(checkpoint.offset);
    }

    /// Record an attempted item
    ///
    /// Returns `false` for an index that was already recorded (or lies below
    /// the resume offset); callers must not count it again.
    pub(crate) fn record(&mut self, index: u64, success: bool) -> bool {
        if index < self.watermark || self.parked.contains_key(&index) {
            return false;
        }
        self.parked.insert(index, success);
        while let Some(success) = self.parked.remove(&self.watermark) {
            if success {
                self.committed.processed += 1;
            } else {
                self.committed.failed += 1;
            }
            self.watermark += 1;
        }
        self.since_last += 1;
        true
    }

    /// Whether `checkpoint_interval` items were attempted since the last save
    pub(crate) fn is_due(&self) -> bool {
        self.since_last >= self.interval
    }

    /// Current contiguous watermark
    pub(crate) fn offset(&self) -> u64 {
        self.watermark
    }

    pub(crate) fn last_saved_offset(&self) -> Option<u64> {
        self.last_saved_offset
    }

    /// Counters for every item below the watermark
    pub(crate) fn snapshot(&self, total: u64) -> CheckpointCounters {
        CheckpointCounters {
            total: total.max(self.watermark),
            ..self.committed
        }
    }

    /// Persist the watermark if it moved since the last save
    ///
    /// Returns whether a checkpoint was written.
    pub(crate) async fn checkpoint(&mut self, total: u64) -> Result<bool, CheckpointError> {
        let advanced = match self.last_saved_offset {
            Some(saved) => self.watermark > saved,
            None => self.watermark > 0,
        };
        if !advanced {
            return Ok(false);
        }

        let checkpoint = Checkpoint::new(self.job_id, self.watermark, self.snapshot(total));
        self.store.save(&checkpoint).await?;

        debug!(
            job_id = %self.job_id,
            offset = checkpoint.offset,
            processed = checkpoint.counters.processed,
            failed = checkpoint.counters.failed,
            "checkpoint saved"
        );
        self.last_saved_offset = Some(self.watermark);
        self.since_last = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;

    fn manager(interval: usize) -> (CheckpointManager, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let manager = CheckpointManager::new(JobId::new(), store.clone(), interval);
        (manager, store)
    }

    #[test]
    fn test_watermark_waits_for_gaps() {
        let (mut manager, _) = manager(10);

        assert!(manager.record(1, true));
        assert!(manager.record(2, false));
        assert_eq!(manager.offset(), 0);

        assert!(manager.record(0, true));
        assert_eq!(manager.offset(), 3);

        let counters = manager.snapshot(0);
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.total, 3);
    }

    #[test]
    fn test_replayed_index_is_rejected() {
        let (mut manager, _) = manager(10);

        assert!(manager.record(0, true));
        assert!(!manager.record(0, true));
        assert!(manager.record(2, true));
        assert!(!manager.record(2, false));
    }

    #[test]
    fn test_is_due_after_interval() {
        let (mut manager, _) = manager(3);

        manager.record(0, true);
        manager.record(1, true);
        assert!(!manager.is_due());
        manager.record(2, true);
        assert!(manager.is_due());
    }

    #[tokio::test]
    async fn test_checkpoint_saves_only_when_advanced() {
        let (mut manager, store) = manager(2);

        assert!(!manager.checkpoint(10).await.unwrap());

        manager.record(0, true);
        manager.record(1, false);
        assert!(manager.checkpoint(10).await.unwrap());
        assert!(!manager.is_due());
        assert!(!manager.checkpoint(10).await.unwrap());
        assert_eq!(store.save_count(), 1);

        let saved = store.load(manager.job_id).await.unwrap().unwrap();
        assert_eq!(saved.offset, 2);
        assert_eq!(saved.counters.processed, 1);
        assert_eq!(saved.counters.failed, 1);
        assert_eq!(saved.counters.total, 10);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let (mut manager, _) = manager(5);
        let checkpoint = Checkpoint::new(
            manager.job_id,
            40,
            CheckpointCounters {
                processed: 38,
                failed: 2,
                total: 100,
            },
        );

        manager.resume_from(&checkpoint);
        assert_eq!(manager.offset(), 40);
        assert_eq!(manager.last_saved_offset(), Some(40));
        assert!(!manager.record(39, true));
        assert!(manager.record(40, true));
        assert_eq!(manager.snapshot(100).processed, 39);
    }
}
