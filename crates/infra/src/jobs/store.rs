//! Job storage implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use recordchain_core::JobId;

use super::types::{Job, JobState, Revision};

/// Job store abstraction.
///
/// The store is the source of truth for job content. Compare-and-set on
/// (state, lease token) is the only synchronization workers and schedulers
/// rely on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace the stored job iff it is still at `expected`.
    ///
    /// Returns `Ok(false)` when another writer moved it first. Jobs entering
    /// a terminal state count against the retention cap of that state.
    async fn compare_and_set(&self, expected: Revision, job: &Job) -> Result<bool, JobStoreError>;

    /// Delayed jobs due at `now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError>;

    /// Active jobs whose lease has expired at `now`.
    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError>;

    /// Queued jobs untouched since `before`, oldest first. Their ready-queue
    /// entry may have been lost.
    async fn stale_queued(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, state: JobState) {
        *self.slot(state) += 1;
    }

    pub(crate) fn slot(&mut self, state: JobState) -> &mut usize {
        match state {
            JobState::Queued => &mut self.queued,
            JobState::Active => &mut self.active,
            JobState::Delayed => &mut self.delayed,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        }
    }
}

/// How many terminal jobs of each outcome are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: usize,
    pub failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: 1000,
            failed: 1000,
        }
    }
}

impl Retention {
    pub fn cap(&self, state: JobState) -> Option<usize> {
        match state {
            JobState::Completed => Some(self.completed),
            JobState::Failed => Some(self.failed),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Terminal job ids in the order they finished.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl Inner {
    fn retire(&mut self, id: JobId, state: JobState, cap: usize) {
        let ring = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return,
        };
        ring.push_back(id);
        while ring.len() > cap {
            if let Some(oldest) = ring.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    retention: Retention,
}

impl InMemoryJobStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retention,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn compare_and_set(&self, expected: Revision, job: &Job) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        let current = inner.jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if current.revision() != expected {
            return Ok(false);
        }
        *current = job.clone();

        if let Some(cap) = self.retention.cap(job.state) {
            if !expected.state.is_terminal() {
                inner.retire(job.id, job.state, cap);
            }
        }
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let inner = self.read()?;
        let mut due: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Delayed)
            .filter_map(|j| j.next_eligible_at.map(|at| (at, j.id)))
            .filter(|(at, _)| *at <= now)
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let inner = self.read()?;
        let mut expired: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .filter_map(|j| j.lease.as_ref().map(|l| (l.expires_at, j.id)))
            .filter(|(at, _)| *at <= now)
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn stale_queued(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let inner = self.read()?;
        let mut stale: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && j.updated_at <= before)
            .map(|j| (j.updated_at, j.id))
            .collect();
        stale.sort();
        Ok(stale.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.count(job.state);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::types::{JobResult, RetryPolicy, after};
    use proptest::prelude::*;
    use recordchain_core::{ClassifiedError, ErrorClass, IdentityRef, OrgId};

    fn new_job() -> Job {
        Job::new(
            IdentityRef::org(OrgId::new("Org1").unwrap()),
            "CreateAsset",
            vec![],
            RetryPolicy::fixed(3, Duration::from_millis(100)),
            Utc::now(),
        )
    }

    /// Claim and finish a job through the store.
    async fn finish(store: &InMemoryJobStore, succeed: bool) -> JobId {
        let mut job = new_job();
        let id = job.id;
        store.insert(job.clone()).await.unwrap();

        let queued = job.revision();
        job.claim("w", Duration::from_secs(60), Utc::now()).unwrap();
        assert!(store.compare_and_set(queued, &job).await.unwrap());

        let active = job.revision();
        if succeed {
            let tx = job.pending_tx.clone().unwrap();
            job.mark_completed(
                JobResult {
                    transaction_id: tx,
                    payload: String::new(),
                    validation_code: None,
                    block_height: None,
                },
                None,
                Utc::now(),
            )
            .unwrap();
        } else {
            let err = ClassifiedError::business(recordchain_core::BusinessKind::Other, "nope");
            job.mark_failed(err, false, Utc::now()).unwrap();
        }
        assert!(store.compare_and_set(active, &job).await.unwrap());
        id
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::default();
        let job = new_job();
        store.insert(job.clone()).await.unwrap();

        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(matches!(
            store.insert(job.clone()).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryJobStore::default();
        let job = new_job();
        store.insert(job.clone()).await.unwrap();

        let mut a = job.clone();
        let mut b = job.clone();
        a.claim("worker-a", Duration::from_secs(60), Utc::now()).unwrap();
        b.claim("worker-b", Duration::from_secs(60), Utc::now()).unwrap();

        assert!(store.compare_and_set(job.revision(), &a).await.unwrap());
        assert!(!store.compare_and_set(job.revision(), &b).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.lease.unwrap().holder, "worker-a");
    }

    #[tokio::test]
    async fn stale_lease_cannot_write() {
        let store = InMemoryJobStore::default();
        let mut job = new_job();
        store.insert(job.clone()).await.unwrap();
        let now = Utc::now();

        let queued = job.revision();
        job.claim("slow", Duration::from_secs(1), now).unwrap();
        store.compare_and_set(queued, &job).await.unwrap();
        let slow = job.clone();

        // Lease expires and the job is reclaimed and claimed again.
        let later = after(now, Duration::from_secs(2));
        job.reclaim(later).unwrap();
        assert!(store.compare_and_set(slow.revision(), &job).await.unwrap());
        let requeued = job.revision();
        job.claim("fast", Duration::from_secs(60), later).unwrap();
        assert!(store.compare_and_set(requeued, &job).await.unwrap());

        let mut late = slow.clone();
        late.mark_failed(ClassifiedError::new(ErrorClass::Timeout, "t"), false, later)
            .unwrap();
        assert!(!store.compare_and_set(slow.revision(), &late).await.unwrap());
    }

    #[tokio::test]
    async fn due_and_expired_scans() {
        let store = InMemoryJobStore::default();
        let now = Utc::now();

        let mut delayed = new_job();
        delayed.claim("w", Duration::from_secs(60), now).unwrap();
        delayed.mark_failed(ClassifiedError::new(ErrorClass::Unavailable, "u"), false, now).unwrap();
        store.insert(delayed.clone()).await.unwrap();

        let mut active = new_job();
        active.claim("w", Duration::from_secs(5), now).unwrap();
        store.insert(active.clone()).await.unwrap();

        assert!(store.due(now, 10).await.unwrap().is_empty());
        assert_eq!(store.due(after(now, Duration::from_millis(100)), 10).await.unwrap(), vec![delayed.id]);

        assert!(store.expired(now, 10).await.unwrap().is_empty());
        assert_eq!(store.expired(after(now, Duration::from_secs(5)), 10).await.unwrap(), vec![active.id]);
    }

    #[tokio::test]
    async fn stale_queued_scan_skips_fresh_and_claimed_jobs() {
        let store = InMemoryJobStore::default();
        let now = Utc::now();

        let stale = new_job();
        store.insert(stale.clone()).await.unwrap();
        let mut claimed = new_job();
        claimed.claim("w", Duration::from_secs(60), now).unwrap();
        store.insert(claimed).await.unwrap();

        let before = after(stale.updated_at, Duration::from_millis(1));
        assert_eq!(store.stale_queued(before, 10).await.unwrap(), vec![stale.id]);

        let mut refreshed = stale.clone();
        refreshed.refresh(after(before, Duration::from_secs(1))).unwrap();
        assert!(store.compare_and_set(stale.revision(), &refreshed).await.unwrap());
        assert!(store.stale_queued(before, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_evicts_oldest_terminal_first() {
        let store = InMemoryJobStore::new(Retention { completed: 2, failed: 1 });

        let c1 = finish(&store, true).await;
        let c2 = finish(&store, true).await;
        let c3 = finish(&store, true).await;
        let f1 = finish(&store, false).await;
        let f2 = finish(&store, false).await;

        assert!(store.get(c1).await.unwrap().is_none());
        assert!(store.get(c2).await.unwrap().is_some());
        assert!(store.get(c3).await.unwrap().is_some());
        assert!(store.get(f1).await.unwrap().is_none());
        assert!(store.get(f2).await.unwrap().is_some());

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.completed, stats.failed), (2, 1));
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::default();
        for _ in 0..3 {
            store.insert(new_job()).await.unwrap();
        }
        finish(&store, true).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    proptest! {
        #[test]
        fn retained_counts_never_exceed_caps(
            cap_ok in 1usize..5,
            cap_err in 1usize..5,
            outcomes in proptest::collection::vec(any::<bool>(), 0..20),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = InMemoryJobStore::new(Retention { completed: cap_ok, failed: cap_err });
            rt.block_on(async {
                for ok in &outcomes {
                    finish(&store, *ok).await;
                }
            });
            let stats = rt.block_on(store.stats()).unwrap();
            prop_assert!(stats.completed <= cap_ok);
            prop_assert!(stats.failed <= cap_err);
        }
    }
}
