//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use recordchain_core::{ClassifiedError, DomainError, DomainResult, ErrorClass, IdentityRef, JobId, TxId, ValidationCode};

/// Job state.
///
/// `queued → active → {completed | delayed | failed}`, `delayed → queued`.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the ready queue
    Queued,
    /// Leased to a worker
    Active,
    /// Waiting for its retry time
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state: {s}")))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(DomainError::validation(format!(
                "backoff must be fixed or exponential, got {other:?}"
            ))),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(3000),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    /// Check if another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Exclusive claim of a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    /// Fresh per claim; a worker whose lease was reclaimed can no longer write.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What a compare-and-set checks: the stored job must still be in this
/// state and held under this lease token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    pub state: JobState,
    pub lease: Option<Uuid>,
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub transaction_id: TxId,
    /// Chaincode response, lossily decoded as UTF-8.
    pub payload: String,
    /// Absent when confirmation was unavailable.
    pub validation_code: Option<ValidationCode>,
    pub block_height: Option<u64>,
}

/// A transaction submission job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Who the transaction is submitted as
    pub identity: IdentityRef,
    pub tx_name: String,
    pub args: Vec<String>,
    pub state: JobState,
    /// Attempts started so far; incremented on claim
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub lease: Option<Lease>,
    /// Transaction id the next attempt will (re)submit under
    pub pending_tx: Option<TxId>,
    /// Every transaction id this job has used, oldest first
    pub transaction_ids: Vec<TxId>,
    pub result: Option<JobResult>,
    /// Last error; final cause once `failed`
    pub error: Option<ClassifiedError>,
    /// Set on a completed job whose confirmation was unavailable
    pub confirmation: Option<ClassifiedError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        identity: IdentityRef,
        tx_name: impl Into<String>,
        args: Vec<String>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            identity,
            tx_name: tx_name.into(),
            args,
            state: JobState::Queued,
            attempts: 0,
            retry_policy,
            lease: None,
            pending_tx: None,
            transaction_ids: Vec::new(),
            result: None,
            error: None,
            confirmation: None,
            created_at: now,
            updated_at: now,
            last_attempted_at: None,
            next_eligible_at: None,
            completed_at: None,
        }
    }

    pub fn revision(&self) -> Revision {
        Revision {
            state: self.state,
            lease: self.lease.as_ref().map(|l| l.token),
        }
    }

    fn expect_state(&self, expected: JobState, action: &str) -> DomainResult<()> {
        if self.state != expected {
            return Err(DomainError::invalid_transition(format!(
                "cannot {action} job {} in state {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Lease the job to `holder` and start the next attempt.
    ///
    /// Picks the transaction id for the attempt: the pending one if a
    /// previous attempt left it, otherwise a fresh one.
    pub fn claim(&mut self, holder: impl Into<String>, lease_for: Duration, now: DateTime<Utc>) -> DomainResult<&Lease> {
        self.expect_state(JobState::Queued, "claim")?;
        if !self.retry_policy.should_retry(self.attempts) {
            return Err(DomainError::invalid_transition(format!(
                "job {} has used all {} attempts",
                self.id, self.retry_policy.max_attempts
            )));
        }

        if self.pending_tx.is_none() {
            let tx_id = TxId::generate();
            self.transaction_ids.push(tx_id.clone());
            self.pending_tx = Some(tx_id);
        }
        self.state = JobState::Active;
        self.attempts += 1;
        self.last_attempted_at = Some(now);
        self.updated_at = now;
        Ok(self.lease.insert(Lease {
            holder: holder.into(),
            token: Uuid::now_v7(),
            expires_at: after(now, lease_for),
        }))
    }

    /// Record success.
    pub fn mark_completed(
        &mut self,
        result: JobResult,
        confirmation: Option<ClassifiedError>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.expect_state(JobState::Active, "complete")?;
        self.state = JobState::Completed;
        self.result = Some(result);
        self.confirmation = confirmation;
        self.error = None;
        self.lease = None;
        self.pending_tx = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors move the job to `delayed` while attempts remain;
    /// anything else ends it `failed`. `fresh_tx` drops the pending
    /// transaction id so the retry submits under a new one.
    pub fn mark_failed(&mut self, error: ClassifiedError, fresh_tx: bool, now: DateTime<Utc>) -> DomainResult<JobState> {
        self.expect_state(JobState::Active, "fail")?;
        self.lease = None;
        self.updated_at = now;

        if error.class.is_retryable() && self.retry_policy.should_retry(self.attempts) {
            let delay = self.retry_policy.delay_for_attempt(self.attempts);
            if fresh_tx {
                self.pending_tx = None;
            }
            self.state = JobState::Delayed;
            self.next_eligible_at = Some(after(now, delay));
        } else {
            self.state = JobState::Failed;
            self.pending_tx = None;
            self.completed_at = Some(now);
        }
        self.error = Some(error);
        Ok(self.state)
    }

    /// `delayed → queued` once the retry time has passed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_state(JobState::Delayed, "promote")?;
        if self.next_eligible_at.is_some_and(|at| at > now) {
            return Err(DomainError::invalid_transition(format!("job {} is not due yet", self.id)));
        }
        self.state = JobState::Queued;
        self.next_eligible_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Restart the visibility window of a `queued` job whose ready-queue
    /// entry may have been lost.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.expect_state(JobState::Queued, "refresh")?;
        self.updated_at = now;
        Ok(())
    }

    /// Take an `active` job back from a worker whose lease expired.
    ///
    /// Back to `queued` while attempts remain (the pending transaction id is
    /// kept, the earlier attempt may have reached the ledger), otherwise
    /// `failed` with a timeout.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<JobState> {
        self.expect_state(JobState::Active, "reclaim")?;
        if !self.lease.as_ref().is_some_and(|l| l.is_expired(now)) {
            return Err(DomainError::invalid_transition(format!("lease on job {} has not expired", self.id)));
        }
        self.lease = None;
        self.updated_at = now;

        let error = ClassifiedError::new(ErrorClass::Timeout, "lease expired");
        if self.retry_policy.should_retry(self.attempts) {
            self.state = JobState::Queued;
        } else {
            self.state = JobState::Failed;
            self.pending_tx = None;
            self.completed_at = Some(now);
        }
        self.error = Some(error);
        Ok(self.state)
    }

    /// Caller-facing view.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id,
            identity: self.identity.to_string(),
            transaction_name: self.tx_name.clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.retry_policy.max_attempts,
            transaction_ids: self.transaction_ids.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            confirmation: self.confirmation.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_attempted_at: self.last_attempted_at,
            next_eligible_at: self.next_eligible_at,
            completed_at: self.completed_at,
        }
    }
}

/// Snapshot of a job as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub identity: String,
    pub transaction_name: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub transaction_ids: Vec<TxId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ClassifiedError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use recordchain_core::OrgId;

    fn job(policy: RetryPolicy) -> Job {
        Job::new(
            IdentityRef::org(OrgId::new("Org1").unwrap()),
            "CreateAsset",
            vec!["A1".to_string(), "{}".to_string()],
            policy,
            Utc::now(),
        )
    }

    fn timeout() -> ClassifiedError {
        ClassifiedError::new(ErrorClass::Timeout, "commit timed out")
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job(RetryPolicy::default());
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);

        let now = Utc::now();
        job.claim("w1", Duration::from_secs(60), now).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts, 1);
        let tx_id = job.pending_tx.clone().unwrap();

        job.mark_completed(
            JobResult {
                transaction_id: tx_id.clone(),
                payload: String::new(),
                validation_code: Some(ValidationCode::valid()),
                block_height: Some(7),
            },
            None,
            now,
        )
        .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.transaction_ids, vec![tx_id]);
        assert!(job.lease.is_none());

        // Terminal states are final.
        assert!(job.promote(now).is_err());
        assert!(job.claim("w2", Duration::from_secs(60), now).is_err());
        assert!(job.mark_failed(timeout(), false, now).is_err());
    }

    #[test]
    fn retry_keeps_or_renews_the_transaction_id() {
        let mut job = job(RetryPolicy::fixed(3, Duration::from_millis(100)));
        let now = Utc::now();

        job.claim("w1", Duration::from_secs(60), now).unwrap();
        let first = job.pending_tx.clone().unwrap();
        assert_eq!(job.mark_failed(timeout(), false, now).unwrap(), JobState::Delayed);
        assert_eq!(job.next_eligible_at, Some(after(now, Duration::from_millis(100))));

        job.promote(after(now, Duration::from_millis(100))).unwrap();
        job.claim("w1", Duration::from_secs(60), now).unwrap();
        assert_eq!(job.pending_tx.as_ref(), Some(&first));

        let conflict = ClassifiedError::new(ErrorClass::EndorsementFailure, "MVCC_READ_CONFLICT");
        job.mark_failed(conflict, true, now).unwrap();
        job.promote(DateTime::<Utc>::MAX_UTC).unwrap();
        job.claim("w1", Duration::from_secs(60), now).unwrap();
        assert_ne!(job.pending_tx.as_ref(), Some(&first));
        assert_eq!(job.transaction_ids.len(), 2);
    }

    #[test]
    fn business_error_fails_without_retry() {
        let mut job = job(RetryPolicy::default());
        let now = Utc::now();
        job.claim("w1", Duration::from_secs(60), now).unwrap();

        let err = ClassifiedError::business(recordchain_core::BusinessKind::AlreadyExists, "exists");
        assert_eq!(job.mark_failed(err, false, now).unwrap(), JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.next_eligible_at.is_none());
    }

    #[test]
    fn promote_waits_for_the_retry_time() {
        let mut job = job(RetryPolicy::fixed(2, Duration::from_secs(10)));
        let now = Utc::now();
        job.claim("w1", Duration::from_secs(60), now).unwrap();
        job.mark_failed(timeout(), false, now).unwrap();

        assert!(job.promote(now).is_err());
        job.promote(after(now, Duration::from_secs(10))).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.next_eligible_at.is_none());
    }

    #[test]
    fn reclaim_requeues_then_fails_on_last_attempt() {
        let mut job = job(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let now = Utc::now();
        let later = after(now, Duration::from_secs(61));

        job.claim("w1", Duration::from_secs(60), now).unwrap();
        assert!(job.reclaim(now).is_err());
        assert_eq!(job.reclaim(later).unwrap(), JobState::Queued);
        assert!(job.pending_tx.is_some());

        job.claim("w2", Duration::from_secs(60), now).unwrap();
        assert_eq!(job.reclaim(later).unwrap(), JobState::Failed);
        assert_eq!(job.error.as_ref().unwrap().class, ErrorClass::Timeout);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn refresh_only_touches_queued_jobs() {
        let start = Utc::now();
        let mut job = job(RetryPolicy::default());
        let revision = job.revision();

        let later = after(start, Duration::from_secs(60));
        job.refresh(later).unwrap();
        assert_eq!(job.updated_at, later);
        assert_eq!(job.revision(), revision);

        job.claim("w-1", Duration::from_secs(60), later).unwrap();
        assert!(job.refresh(later).is_err());
    }

    #[test]
    fn each_claim_gets_a_new_lease_token() {
        let mut job = job(RetryPolicy::default());
        let now = Utc::now();
        let first = job.claim("w1", Duration::from_secs(1), now).unwrap().token;
        job.reclaim(after(now, Duration::from_secs(2))).unwrap();
        let second = job.claim("w2", Duration::from_secs(1), now).unwrap().token;
        assert_ne!(first, second);
    }

    proptest! {
        #[test]
        fn exponential_delay_doubles(base_ms in 1u64..10_000, k in 1u32..20) {
            let policy = RetryPolicy::exponential(30, Duration::from_millis(base_ms));
            prop_assert_eq!(policy.delay_for_attempt(k), Duration::from_millis(base_ms * (1u64 << (k - 1))));
        }

        #[test]
        fn fixed_delay_is_constant(base_ms in 1u64..100_000, k in 1u32..1000) {
            let policy = RetryPolicy::fixed(5, Duration::from_millis(base_ms));
            prop_assert_eq!(policy.delay_for_attempt(k), Duration::from_millis(base_ms));
        }

        #[test]
        fn attempts_never_exceed_the_cap(max in 1u32..8, failures in 0usize..20) {
            let mut job = job(RetryPolicy::fixed(max, Duration::ZERO));
            let now = Utc::now();
            for _ in 0..failures {
                match job.state {
                    JobState::Queued => { job.claim("w", Duration::from_secs(1), now).unwrap(); }
                    JobState::Active => { job.mark_failed(timeout(), false, now).unwrap(); }
                    JobState::Delayed => job.promote(now).unwrap(),
                    JobState::Completed | JobState::Failed => break,
                }
                prop_assert!(job.attempts <= max);
            }
        }
    }
}
