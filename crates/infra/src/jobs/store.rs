//! Job storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use statecraft_core::Problem;

use super::types::{DeadLetterEntry, Job, JobId, JobKind, JobStatus, RetryPolicy};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Queue a new job; the store assigns its id.
    fn enqueue(&self, kind: JobKind, payload: serde_json::Value, policy: RetryPolicy) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest pending or retriable job that is ready, marking it running.
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// `None` lists every status.
    fn list_by_status(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn list_by_kind(&self, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a fresh attempt count.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Drop completed jobs last touched before `older_than`. Returns how many went.
    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for Problem {
    fn from(err: JobStoreError) -> Self {
        Problem::internal(err.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store.
///
/// Completed jobs stay queryable until [`JobStore::purge_completed`] removes them.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

fn oldest_first(jobs: &mut [Job]) {
    jobs.sort_by_key(|j| (j.created_at, j.id.0));
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, kind: JobKind, payload: serde_json::Value, policy: RetryPolicy) -> Result<JobId, JobStoreError> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let job = Job::new(id, kind, payload).with_retry_policy(policy);
        self.jobs.write().map_err(poisoned)?.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().map_err(poisoned)?.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        let next = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }) && j.is_ready())
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn list_by_status(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| {
                status
                    .as_ref()
                    .is_none_or(|s| std::mem::discriminant(&j.status) == std::mem::discriminant(s))
            })
            .cloned()
            .collect();
        oldest_first(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    fn list_by_kind(&self, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<Job> = jobs.values().filter(|j| &j.kind == kind).cloned().collect();
        oldest_first(&mut result);
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<DeadLetterEntry> = dls.values().cloned().collect();
        result.sort_by_key(|e| (e.dead_lettered_at, e.job.id.0));
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut dls = self.dead_letters.write().map_err(poisoned)?;
        dls.remove(&job_id).map(|_| ()).ok_or(JobStoreError::NotFound(job_id))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;

        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();
        Ok(stats)
    }

    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < older_than));
        Ok(before - jobs.len())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, kind: JobKind, payload: serde_json::Value, policy: RetryPolicy) -> Result<JobId, JobStoreError> {
        (**self).enqueue(kind, payload, policy)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn list_by_status(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn list_by_kind(&self, kind: &JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_kind(kind, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_dead_letter(job_id)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }

    fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_completed(older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(store: &InMemoryJobStore, kind: &str) -> JobId {
        store
            .enqueue(JobKind::new(kind), serde_json::json!({}), RetryPolicy::default())
            .unwrap()
    }

    #[test]
    fn ids_are_sequential() {
        let store = InMemoryJobStore::new();
        assert_eq!(enqueue(&store, "a"), JobId(1));
        assert_eq!(enqueue(&store, "a"), JobId(2));
    }

    #[test]
    fn enqueue_and_claim_in_fifo_order() {
        let store = InMemoryJobStore::new();
        let first = enqueue(&store, "a");
        let second = enqueue(&store, "b");

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        assert_eq!(store.claim_next().unwrap().unwrap().id, second);
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn dead_letter_round_trip() {
        let store = InMemoryJobStore::new();
        let id = enqueue(&store, "a");

        let mut claimed = store.claim_next().unwrap().unwrap();
        claimed.mark_failed("broken".to_string(), Utc::now());
        store.dead_letter(claimed, "max retries exceeded".to_string()).unwrap();

        assert!(store.get(id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "max retries exceeded");

        let retried = store.retry_dead_letter(id).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt, 0);
        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert_eq!(store.delete_dead_letter(id), Err(JobStoreError::NotFound(id)));
    }

    #[test]
    fn stats_and_listing() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            enqueue(&store, "todo.update_user_bill");
        }
        enqueue(&store, "other");
        store.claim_next().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 1);

        let bills = store.list_by_kind(&JobKind::new("todo.update_user_bill"), 10).unwrap();
        assert_eq!(bills.len(), 3);
        let pending = store.list_by_status(Some(JobStatus::Pending), 2).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn purge_drops_only_old_completed_jobs() {
        let store = InMemoryJobStore::new();
        let done = enqueue(&store, "a");
        let waiting = enqueue(&store, "b");

        let mut claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, done);
        claimed.mark_completed(Utc::now());
        store.update(&claimed).unwrap();

        assert_eq!(store.purge_completed(claimed.updated_at).unwrap(), 0);
        assert_eq!(store.stats().unwrap().completed, 1);

        let later = claimed.updated_at + chrono::Duration::seconds(1);
        assert_eq!(store.purge_completed(later).unwrap(), 1);
        assert!(store.get(done).unwrap().is_none());
        assert_eq!(store.get(waiting).unwrap().unwrap().status, JobStatus::Pending);
    }
}
