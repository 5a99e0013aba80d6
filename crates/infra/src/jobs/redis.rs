//! Redis-backed job store and ready queue (durable across restarts).
//!
//! ## Layout
//!
//! - `{prefix}:job:{id}`: hash with `state`, `lease` (token or empty) and `data` (job JSON)
//! - `{prefix}:idx:{state}`: sorted set of job ids per state; the score is the
//!   time the scheduler cares about (retry time for `delayed`, lease expiry for
//!   `active`, finish time for terminal states, last update for `queued`)
//! - `{prefix}:ready`: list of ready job ids
//!
//! Insert and compare-and-set run as Lua scripts so the revision check, the
//! index move and retention trimming are atomic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use recordchain_core::JobId;

use super::queue::JobQueue;
use super::store::{JobStats, JobStore, JobStoreError, Retention};
use super::types::{Job, JobState, Revision};

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "submit";

/// Upper bound on one empty-queue poll sleep.
const POP_POLL: Duration = Duration::from_millis(50);

const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[1], 'lease', '', 'data', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
";

const CAS_SCRIPT: &str = r"
local cur = redis.call('HMGET', KEYS[1], 'state', 'lease')
if not cur[1] then
  return -1
end
if cur[1] ~= ARGV[1] or cur[2] ~= ARGV[2] then
  return 0
end
local prefix = ARGV[8]
local id = ARGV[7]
redis.call('HSET', KEYS[1], 'state', ARGV[3], 'lease', ARGV[4], 'data', ARGV[5])
redis.call('ZREM', prefix .. ':idx:' .. cur[1], id)
local idx = prefix .. ':idx:' .. ARGV[3]
redis.call('ZADD', idx, ARGV[6], id)
local cap = tonumber(ARGV[9])
if cap >= 0 and cur[1] ~= 'completed' and cur[1] ~= 'failed' then
  local excess = redis.call('ZCARD', idx) - cap
  if excess > 0 then
    local evicted = redis.call('ZPOPMIN', idx, excess)
    for i = 1, #evicted, 2 do
      redis.call('DEL', prefix .. ':job:' .. evicted[i])
    end
  end
end
return 1
";

fn storage(e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Index score for a job in its current state.
fn score(job: &Job) -> i64 {
    let at = match job.state {
        JobState::Delayed => job.next_eligible_at,
        JobState::Active => job.lease.as_ref().map(|l| l.expires_at),
        JobState::Completed | JobState::Failed => job.completed_at,
        JobState::Queued => None,
    };
    millis(at.unwrap_or(job.updated_at))
}

fn lease_field(lease: Option<uuid::Uuid>) -> String {
    lease.map(|t| t.to_string()).unwrap_or_default()
}

/// Job store and ready queue over one Redis database.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
    retention: Retention,
    insert: Script,
    cas: Script,
}

impl RedisJobStore {
    /// Connect to `redis_url` and keep one multiplexed connection.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
        retention: Retention,
    ) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(storage)?;
        let conn = client.get_multiplexed_tokio_connection().await.map_err(storage)?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to redis job store");

        Ok(Self {
            conn,
            prefix,
            retention,
            insert: Script::new(INSERT_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn index_key(&self, state: JobState) -> String {
        format!("{}:idx:{}", self.prefix, state.as_str())
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    async fn scan(&self, state: JobState, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.index_key(state))
            .arg("-inf")
            .arg(millis(now))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        ids.iter().map(|id| id.parse().map_err(storage)).collect()
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let data = serde_json::to_string(&job).map_err(storage)?;
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .insert
            .key(self.job_key(job.id))
            .key(self.index_key(job.state))
            .arg(job.state.as_str())
            .arg(data)
            .arg(score(&job))
            .arg(job.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        if inserted == 0 {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(self.job_key(id))
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        data.map(|raw| serde_json::from_str(&raw).map_err(storage)).transpose()
    }

    async fn compare_and_set(&self, expected: Revision, job: &Job) -> Result<bool, JobStoreError> {
        let data = serde_json::to_string(job).map_err(storage)?;
        let cap = self
            .retention
            .cap(job.state)
            .and_then(|c| i64::try_from(c).ok())
            .unwrap_or(-1);

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .cas
            .key(self.job_key(job.id))
            .arg(expected.state.as_str())
            .arg(lease_field(expected.lease))
            .arg(job.state.as_str())
            .arg(lease_field(job.revision().lease))
            .arg(data)
            .arg(score(job))
            .arg(job.id.to_string())
            .arg(&self.prefix)
            .arg(cap)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        match outcome {
            -1 => Err(JobStoreError::NotFound(job.id)),
            0 => {
                debug!(job_id = %job.id, expected = %expected.state, "compare-and-set lost");
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        self.scan(JobState::Delayed, now, limit).await
    }

    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        self.scan(JobState::Active, now, limit).await
    }

    async fn stale_queued(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        self.scan(JobState::Queued, before, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut pipe = redis::pipe();
        for state in JobState::ALL {
            pipe.cmd("ZCARD").arg(self.index_key(state));
        }
        let mut conn = self.conn.clone();
        let counts: Vec<usize> = pipe.query_async(&mut conn).await.map_err(storage)?;

        let mut stats = JobStats::default();
        for (state, count) in JobState::ALL.into_iter().zip(counts) {
            *stats.slot(state) = count;
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobQueue for RedisJobStore {
    async fn push(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.ready_key())
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    // Polls with LPOP; a blocking pop would stall every other command on the
    // shared multiplexed connection.
    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, JobStoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn.clone();
        loop {
            let next: Option<String> = redis::cmd("LPOP")
                .arg(self.ready_key())
                .query_async(&mut conn)
                .await
                .map_err(storage)?;
            if let Some(id) = next {
                return id.parse().map(Some).map_err(storage);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL.min(deadline - now)).await;
        }
    }

    async fn len(&self) -> Result<usize, JobStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.ready_key())
            .query_async(&mut conn)
            .await
            .map_err(storage)
    }
}
