//! In-memory job registry

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use super::model::{BatchJob, BatchStatus, JobId, JobMetadata};
use crate::error::BatchError;

/// Registry of batch jobs
///
/// Constructed explicitly and shared through `Arc`; several processors may
/// use the same store. Every mutation happens under a single write lock so
/// readers never observe a half-applied update.
///
/// # Example
///
/// ```
/// use everruns_batch::JobStore;
///
/// let store = JobStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, BatchJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Pending job
    pub fn create(
        &self,
        job_id: JobId,
        total_items: Option<u64>,
        metadata: JobMetadata,
    ) -> Result<BatchJob, BatchError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job_id) {
            return Err(BatchError::DuplicateJob(job_id));
        }
        let job = BatchJob::new(job_id, total_items, metadata);
        jobs.insert(job_id, job.clone());
        Ok(job)
    }

    /// Snapshot of a job
    pub fn get(&self, job_id: JobId) -> Result<BatchJob, BatchError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(BatchError::NotFound(job_id))
    }

    /// Snapshot of all jobs, ordered by id
    pub fn list(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Remove a job that is not running
    pub fn evict(&self, job_id: JobId) -> Result<BatchJob, BatchError> {
        let mut jobs = self.jobs.write();
        match jobs.get(&job_id) {
            None => Err(BatchError::NotFound(job_id)),
            Some(job) if job.status == BatchStatus::Running => {
                Err(BatchError::AlreadyRunning(job_id))
            }
            Some(_) => jobs.remove(&job_id).ok_or(BatchError::NotFound(job_id)),
        }
    }

    /// Move a job to `to`, stamping start/completion times
    pub(crate) fn transition(
        &self,
        job_id: JobId,
        to: BatchStatus,
        error_message: Option<String>,
    ) -> Result<BatchJob, BatchError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(BatchError::NotFound(job_id))?;

        if job.status == BatchStatus::Running && to == BatchStatus::Running {
            return Err(BatchError::AlreadyRunning(job_id));
        }
        if !job.status.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                job_id,
                from: job.status,
                to,
            });
        }

        let now = Utc::now();
        job.status = to;
        if to == BatchStatus::Running {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        if error_message.is_some() {
            job.error_message = error_message;
        }
        job.recompute_progress();
        Ok(job.clone())
    }

    /// Mutate a job's counters in one critical section
    pub(crate) fn apply<F>(&self, job_id: JobId, update: F) -> Result<BatchJob, BatchError>
    where
        F: FnOnce(&mut BatchJob),
    {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(BatchError::NotFound(job_id))?;
        update(job);
        job.recompute_progress();
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;

    fn metadata() -> JobMetadata {
        JobMetadata::new(BatchConfig::default())
    }

    #[test]
    fn test_create_and_get() {
        let store = JobStore::new();
        let id = JobId::new();
        let job = store.create(id, Some(10), metadata()).unwrap();

        assert_eq!(job.status, BatchStatus::Pending);
        assert_eq!(job.total_items, 10);
        assert_eq!(store.get(id).unwrap(), job);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_job() {
        let store = JobStore::new();
        let id = JobId::new();
        store.create(id, None, metadata()).unwrap();

        let result = store.create(id, None, metadata());
        assert!(matches!(result, Err(BatchError::DuplicateJob(dup)) if dup == id));
    }

    #[test]
    fn test_get_unknown_job() {
        let store = JobStore::new();
        assert!(matches!(
            store.get(JobId::new()),
            Err(BatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_ordered() {
        let store = JobStore::new();
        let ids: Vec<JobId> = (0..5).map(|_| JobId::new()).collect();
        for id in ids.iter().rev() {
            store.create(*id, None, metadata()).unwrap();
        }

        let listed: Vec<JobId> = store.list().into_iter().map(|job| job.id).collect();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_transitions() {
        let store = JobStore::new();
        let id = JobId::new();
        store.create(id, Some(2), metadata()).unwrap();

        let running = store.transition(id, BatchStatus::Running, None).unwrap();
        assert!(running.started_at.is_some());

        assert!(matches!(
            store.transition(id, BatchStatus::Running, None),
            Err(BatchError::AlreadyRunning(_))
        ));

        let failed = store
            .transition(id, BatchStatus::Failed, Some("fatal at item 1".into()))
            .unwrap();
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("fatal at item 1"));

        assert!(matches!(
            store.transition(id, BatchStatus::Running, None),
            Err(BatchError::InvalidTransition {
                from: BatchStatus::Failed,
                to: BatchStatus::Running,
                ..
            })
        ));
    }

    #[test]
    fn test_apply_recomputes_progress() {
        let store = JobStore::new();
        let id = JobId::new();
        store.create(id, Some(4), metadata()).unwrap();

        let job = store
            .apply(id, |job| {
                job.processed_items += 1;
                job.failed_items += 1;
            })
            .unwrap();
        assert_eq!(job.progress_percentage, 50.0);
    }

    #[test]
    fn test_evict() {
        let store = JobStore::new();
        let id = JobId::new();
        store.create(id, None, metadata()).unwrap();
        store.transition(id, BatchStatus::Running, None).unwrap();

        assert!(matches!(
            store.evict(id),
            Err(BatchError::AlreadyRunning(_))
        ));

        store.transition(id, BatchStatus::Completed, None).unwrap();
        let evicted = store.evict(id).unwrap();
        assert_eq!(evicted.status, BatchStatus::Completed);
        assert!(store.is_empty());
    }
}
