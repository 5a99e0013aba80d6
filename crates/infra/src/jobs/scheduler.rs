//! Scheduler: promotes due retries, takes back jobs from dead workers and
//! re-pushes queued jobs whose ready-queue entry went missing.
//!
//! Every transition goes through compare-and-set, so any number of
//! scheduler instances can tick against the same store; a job moved by one
//! is skipped by the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use recordchain_core::JobId;

use super::queue::JobQueue;
use super::store::{JobStore, JobStoreError};
use super::types::{JobState, before};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub name: String,
    pub poll_interval: Duration,
    /// Most jobs moved per scan
    pub batch_size: usize,
    /// Age after which an untouched `queued` job is pushed again
    pub requeue_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "submit-scheduler".to_string(),
            poll_interval: Duration::from_millis(250),
            batch_size: 100,
            requeue_after: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_requeue_after(mut self, requeue_after: Duration) -> Self {
        self.requeue_after = requeue_after;
        self
    }
}

/// What one tick moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// `delayed → queued`
    pub promoted: usize,
    /// Expired leases returned to `queued`
    pub requeued: usize,
    /// Expired leases with no attempts left
    pub failed: usize,
    /// Stale `queued` jobs pushed onto the ready queue again
    pub recovered: usize,
    /// Jobs skipped this tick because of a store or queue error
    pub errors: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, config: SchedulerConfig) -> Self {
        Self { store, queue, config }
    }

    /// Run one scan at `now`.
    ///
    /// A failing scan aborts the tick; a failing job is logged and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, JobStoreError> {
        let mut report = TickReport::default();

        for id in self.store.due(now, self.config.batch_size).await? {
            match self.promote(id, now).await {
                Ok(true) => report.promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %id, error = %e, "failed to promote retry");
                }
            }
        }

        for id in self.store.expired(now, self.config.batch_size).await? {
            match self.reclaim(id, now).await {
                Ok(Some(JobState::Queued)) => report.requeued += 1,
                Ok(Some(JobState::Failed)) => report.failed += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %id, error = %e, "failed to reclaim expired lease");
                }
            }
        }

        let cutoff = before(now, self.config.requeue_after);
        for id in self.store.stale_queued(cutoff, self.config.batch_size).await? {
            match self.recover(id, cutoff, now).await {
                Ok(true) => report.recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %id, error = %e, "failed to re-push stale queued job");
                }
            }
        }

        Ok(report)
    }

    async fn promote(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let Some(mut job) = self.store.get(id).await? else {
            return Ok(false);
        };
        let expected = job.revision();
        if job.promote(now).is_err() {
            return Ok(false);
        }
        if !self.store.compare_and_set(expected, &job).await? {
            debug!(job_id = %id, "retry already promoted elsewhere");
            return Ok(false);
        }
        self.queue.push(id).await?;
        debug!(job_id = %id, attempts = job.attempts, "retry promoted");
        Ok(true)
    }

    async fn reclaim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobState>, JobStoreError> {
        let Some(mut job) = self.store.get(id).await? else {
            return Ok(None);
        };
        let expected = job.revision();
        let holder = job.lease.as_ref().map(|l| l.holder.clone()).unwrap_or_default();
        let Ok(next) = job.reclaim(now) else {
            return Ok(None);
        };
        if !self.store.compare_and_set(expected, &job).await? {
            return Ok(None);
        }

        if next == JobState::Queued {
            self.queue.push(id).await?;
            warn!(job_id = %id, holder = %holder, attempts = job.attempts, "lease expired, job requeued");
        } else {
            error!(job_id = %id, holder = %holder, attempts = job.attempts, "lease expired on final attempt, job failed");
        }
        Ok(Some(next))
    }

    async fn recover(&self, id: JobId, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let Some(mut job) = self.store.get(id).await? else {
            return Ok(false);
        };
        if job.updated_at > cutoff {
            return Ok(false);
        }
        let expected = job.revision();
        if job.refresh(now).is_err() {
            return Ok(false);
        }
        if !self.store.compare_and_set(expected, &job).await? {
            return Ok(false);
        }
        self.queue.push(id).await?;
        info!(job_id = %id, attempts = job.attempts, "stale queued job pushed onto the ready queue again");
        Ok(true)
    }

    /// Tick every `poll_interval` until shut down.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let name = self.config.name.clone();
            info!(scheduler = %name, interval_ms = self.config.poll_interval.as_millis() as u64, "scheduler started");

            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        match self.tick(Utc::now()).await {
                            Ok(report) if !report.is_empty() => {
                                debug!(
                                    scheduler = %name,
                                    promoted = report.promoted,
                                    requeued = report.requeued,
                                    failed = report.failed,
                                    recovered = report.recovered,
                                    errors = report.errors,
                                    "scheduler tick"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(scheduler = %name, error = %e, "scheduler tick failed"),
                        }
                    }
                }
            }

            info!(scheduler = %name, "scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
