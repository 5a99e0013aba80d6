//! Worker pool: claims ready jobs and drives them through one submit attempt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use recordchain_core::{ClassifiedError, ErrorClass, JobId, TxId};
use recordchain_ledger::{Confirmation, SubmitError, Submitted, TransportError};

use super::pipeline::SubmitPipeline;
use super::store::JobStoreError;
use super::types::{Job, JobResult, JobState};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum jobs executing at once across the pool
    pub concurrency: usize,
    /// How long a claim stays exclusive
    pub lease: Duration,
    /// How long one queue poll waits for work
    pub poll_wait: Duration,
    /// Name for logging and lease holders
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            lease: Duration::from_secs(363),
            poll_wait: Duration::from_millis(250),
            name: "submit-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_delayed: u64,
    pub jobs_failed: u64,
    /// Claims lost to another worker, or stale queue entries skipped
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Stop taking work and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "worker pool task failed");
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }
}

fn lock(stats: &Mutex<PoolStats>) -> MutexGuard<'_, PoolStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-concurrency pool of submit workers sharing one ready queue.
pub struct WorkerPool {
    pipeline: SubmitPipeline,
    config: WorkerPoolConfig,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    pub fn new(pipeline: SubmitPipeline, config: WorkerPoolConfig) -> Self {
        Self {
            pipeline,
            config,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    /// Spawn the pool on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(Arc::new(self).run(shutdown_rx));

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let name = self.config.name.clone();
        let concurrency = self.config.concurrency.max(1);
        info!(pool = %name, concurrency, "worker pool started");

        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut claims: u64 = 0;

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(pool = %name, error = %e, "worker task panicked");
                }
            }
            lock(&self.stats).uptime_secs = started.elapsed().as_secs();

            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.pipeline.queue.pop(self.config.poll_wait).await {
                Ok(Some(job_id)) => {
                    claims += 1;
                    let holder = format!("{name}-{claims}");
                    let worker = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.execute(job_id, &holder).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(pool = %name, error = %e, "failed to poll the ready queue");
                    tokio::time::sleep(self.config.poll_wait).await;
                }
            }
        }

        info!(pool = %name, in_flight = tasks.len(), "worker pool draining");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(pool = %name, error = %e, "worker task panicked");
            }
        }
        info!(pool = %name, "worker pool stopped");
    }

    async fn execute(&self, job_id: JobId, holder: &str) {
        lock(&self.stats).current_running += 1;
        let outcome = self.process(job_id, holder).await;

        let mut s = lock(&self.stats);
        s.current_running = s.current_running.saturating_sub(1);
        match outcome {
            Ok(Some(state)) => {
                s.jobs_processed += 1;
                match state {
                    JobState::Completed => s.jobs_completed += 1,
                    JobState::Delayed => s.jobs_delayed += 1,
                    JobState::Failed => s.jobs_failed += 1,
                    JobState::Queued | JobState::Active => {}
                }
            }
            Ok(None) => s.jobs_skipped += 1,
            Err(e) => {
                drop(s);
                error!(pool = %self.config.name, job_id = %job_id, error = %e, "job store error");
            }
        }
    }

    /// Claim `job_id` and run one attempt.
    ///
    /// Returns the state the job was left in, or `None` if it was not ours
    /// to run (already claimed, no longer queued, or evicted).
    pub async fn process(&self, job_id: JobId, holder: &str) -> Result<Option<JobState>, JobStoreError> {
        let store = &self.pipeline.store;

        let Some(mut job) = store.get(job_id).await? else {
            debug!(job_id = %job_id, "queued job no longer stored");
            return Ok(None);
        };
        if job.state != JobState::Queued {
            debug!(job_id = %job_id, state = %job.state, "skipping stale queue entry");
            return Ok(None);
        }

        let queued = job.revision();
        if let Err(e) = job.claim(holder, self.config.lease, Utc::now()) {
            warn!(job_id = %job_id, error = %e, "job cannot be claimed");
            return Ok(None);
        }
        if !store.compare_and_set(queued, &job).await? {
            debug!(job_id = %job_id, holder, "job claimed by another worker");
            return Ok(None);
        }

        let Some(tx_id) = job.pending_tx.clone() else {
            return Err(JobStoreError::Storage(format!("claimed job {job_id} has no transaction id")));
        };
        debug!(
            job_id = %job_id,
            tx_id = %tx_id,
            holder,
            attempt = job.attempts,
            identity = %job.identity,
            "job claimed"
        );

        let outcome = self.attempt(&job, &tx_id).await;

        let active = job.revision();
        let now = Utc::now();
        let next = match outcome {
            Ok((submitted, confirmation)) => {
                let result = JobResult {
                    transaction_id: submitted.tx_id,
                    payload: String::from_utf8_lossy(&submitted.payload).into_owned(),
                    validation_code: match &confirmation {
                        Confirmation::Confirmed { validation_code, .. } => Some(validation_code.clone()),
                        Confirmation::Unavailable { .. } => None,
                    },
                    block_height: match &confirmation {
                        Confirmation::Confirmed { block_height, .. } => Some(*block_height),
                        Confirmation::Unavailable { .. } => None,
                    },
                };
                job.mark_completed(result, confirmation.annotation(), now)
                    .map(|()| JobState::Completed)
            }
            Err(err) => {
                // The ledger rejected this transaction id outright; a retry needs a new one.
                let fresh_tx = err.class == ErrorClass::EndorsementFailure;
                job.mark_failed(err, fresh_tx, now)
            }
        }
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        if !store.compare_and_set(active, &job).await? {
            warn!(job_id = %job_id, holder, "lease lost before the outcome was recorded");
            return Ok(None);
        }

        match next {
            JobState::Completed => info!(
                job_id = %job_id,
                tx_id = %tx_id,
                attempts = job.attempts,
                confirmation = job.confirmation.as_ref().map(|c| c.class.as_str()).unwrap_or("confirmed"),
                "job completed"
            ),
            JobState::Delayed => warn!(
                job_id = %job_id,
                attempt = job.attempts,
                max_attempts = job.retry_policy.max_attempts,
                error_class = %job.error.as_ref().map_or("", |e| e.class.as_str()),
                "job attempt failed, retry scheduled"
            ),
            _ => error!(
                job_id = %job_id,
                attempts = job.attempts,
                error = %job.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "job failed"
            ),
        }
        Ok(Some(next))
    }

    /// One submit + confirm round. Classified errors only.
    async fn attempt(&self, job: &Job, tx_id: &TxId) -> Result<(Submitted, Confirmation), ClassifiedError> {
        let broker = &self.pipeline.broker;
        let handle = broker
            .get_handle(&job.identity)
            .await
            .map_err(|e| ClassifiedError::new(e.class(), e.to_string()))?;

        match self
            .pipeline
            .client
            .submit(&handle, tx_id, &job.tx_name, &job.args)
            .await
        {
            Ok(submitted) => {
                let confirmation = self.pipeline.confirmer.confirm(&handle, &submitted.tx_id).await;
                // An id the ledger already knew may belong to an attempt that
                // was ordered and then invalidated.
                if let Confirmation::Confirmed { validation_code, .. } = &confirmation {
                    if !validation_code.is_valid() {
                        warn!(
                            job_id = %job.id,
                            tx_id = %submitted.tx_id,
                            code = %validation_code,
                            duplicate = submitted.duplicate,
                            "transaction committed as invalid"
                        );
                        let err = SubmitError::from(TransportError::CommitInvalid {
                            tx_id: submitted.tx_id.clone(),
                            code: validation_code.clone(),
                        });
                        return Err(err.to_classified());
                    }
                }
                Ok((submitted, confirmation))
            }
            Err(e) => {
                if e.class() == ErrorClass::ConnectionError {
                    broker.invalidate(&handle).await;
                }
                Err(e.to_classified())
            }
        }
    }
}
