//! Durable job registry
//!
//! One JSON document per job under `jobs:record:{id}`, plus two indexes the
//! janitor and telemetry read: a per-state member set and a sorted set of
//! finished jobs scored by `finished_at`.
//!
//! `compare_and_set` is the sole mutation primitive. It runs as a Lua script
//! so the read-compare-write (and the index bookkeeping) is atomic on the
//! backend; workers claim Queued -> Processing through it and only the
//! winner proceeds, which is what enforces at-most-one dispatch fleet-wide.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::RedisPool;
use crate::jobs::{JobId, JobRecord, JobState};
use crate::{Error, Result};

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 'missing'
end
local record = cjson.decode(current)
if record.state ~= ARGV[1] then
  return 'mismatch:' .. record.state
end
if tostring(record.attempt) ~= ARGV[5] then
  return 'stale'
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SREM', KEYS[2], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[3])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[4], tonumber(ARGV[4]), ARGV[3])
end
return 'ok'
"#;

/// Registry over the shared Redis backing
#[derive(Clone)]
pub struct JobRegistry {
    pool: RedisPool,
    cas: Arc<redis::Script>,
}

impl JobRegistry {
    /// Create a registry handle
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            cas: Arc::new(redis::Script::new(CAS_SCRIPT)),
        }
    }

    fn record_key(&self, job_id: JobId) -> String {
        self.pool.key(format!("jobs:record:{}", job_id))
    }

    fn state_key(&self, state: JobState) -> String {
        self.pool.key(format!("jobs:state:{}", state.label()))
    }

    fn finished_key(&self) -> String {
        self.pool.key("jobs:finished")
    }

    fn unavailable(e: crate::backend::StoreError) -> Error {
        Error::RegistryUnavailable(e.to_string())
    }

    /// Create a record, idempotent on `job_id`
    ///
    /// Returns false when a record with this id already exists (the existing
    /// record is left untouched).
    pub async fn create(&self, record: &JobRecord) -> Result<bool> {
        let mut conn = self.pool.conn();
        let payload = serde_json::to_vec(record)?;

        let created = conn
            .set_nx(&self.record_key(record.job_id), &payload)
            .await
            .map_err(Self::unavailable)?;
        if !created {
            warn!(job_id = %record.job_id, "create skipped, record already exists");
            return Ok(false);
        }

        let id = record.job_id.to_string();
        conn.sadd(&self.state_key(record.state), &id)
            .await
            .map_err(Self::unavailable)?;
        if let Some(finished_at) = record.finished_at {
            conn.zadd(&self.finished_key(), finished_at.timestamp() as f64, &id)
                .await
                .map_err(Self::unavailable)?;
        }

        debug!(job_id = %record.job_id, state = %record.state, "job record created");
        Ok(true)
    }

    /// Fetch a record
    pub async fn get(&self, job_id: JobId) -> Result<JobRecord> {
        self.try_get(job_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {} does not exist", job_id)))
    }

    /// Fetch a record, None when absent
    pub async fn try_get(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.pool.conn();
        match conn
            .get(&self.record_key(job_id))
            .await
            .map_err(Self::unavailable)?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Atomically replace a record if its stored state equals `expected`
    ///
    /// `record` carries the already-applied new fields (use the `mark_*`
    /// helpers). The stored attempt counter is matched too, which fences off
    /// a worker whose claim was reclaimed while it was wedged: its writes
    /// carry the old attempt and lose. Errors: `NotFound` when the record
    /// vanished, `StateMismatch` when another actor transitioned it first.
    pub async fn compare_and_set(&self, expected: JobState, record: &JobRecord) -> Result<()> {
        if !JobState::can_transition(expected, record.state) {
            return Err(Error::StateMismatch {
                expected: expected.to_string(),
                actual: record.state.to_string(),
            });
        }

        // A claim increments the counter; every other transition keeps it
        let expected_attempt =
            if expected == JobState::Queued && record.state == JobState::Processing {
                record.attempt.saturating_sub(1)
            } else {
                record.attempt
            };

        let payload = serde_json::to_string(record)?;
        let id = record.job_id.to_string();
        let finished_score = record
            .finished_at
            .map(|t| t.timestamp().to_string())
            .unwrap_or_default();

        let record_key = self.record_key(record.job_id);
        let old_state_key = self.state_key(expected);
        let new_state_key = self.state_key(record.state);
        let finished_key = self.finished_key();

        let mut conn = self.pool.conn();
        let reply = conn
            .eval_script(
                &self.cas,
                &[&record_key, &old_state_key, &new_state_key, &finished_key],
                &[
                    &expected.to_string(),
                    &payload,
                    &id,
                    &finished_score,
                    &expected_attempt.to_string(),
                ],
            )
            .await
            .map_err(Self::unavailable)?;

        match reply.as_str() {
            "ok" => {
                debug!(job_id = %record.job_id, from = %expected, to = %record.state, "state transition");
                Ok(())
            }
            "missing" => Err(Error::not_found(format!("job {} does not exist", record.job_id))),
            "stale" => Err(Error::StateMismatch {
                expected: expected.to_string(),
                actual: "a newer claim".to_string(),
            }),
            other => {
                let actual = other.strip_prefix("mismatch:").unwrap_or(other);
                Err(Error::StateMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                })
            }
        }
    }

    /// Sample up to `limit` job ids currently in `state` (janitor use)
    pub async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.pool.conn();
        let members = conn
            .srandmember(&self.state_key(state), limit)
            .await
            .map_err(Self::unavailable)?;
        Ok(members
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect())
    }

    /// Number of jobs currently in `state`
    pub async fn count_by_state(&self, state: JobState) -> Result<i64> {
        let mut conn = self.pool.conn();
        conn.scard(&self.state_key(state)).await.map_err(Self::unavailable)
    }

    /// Jobs whose `finished_at` is before the cutoff (reaper use)
    pub async fn finished_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        let mut conn = self.pool.conn();
        let members = conn
            .zrangebyscore_upto(&self.finished_key(), cutoff.timestamp() as f64, limit)
            .await
            .map_err(Self::unavailable)?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    /// Remove a record and all its index entries
    pub async fn remove(&self, job_id: JobId) -> Result<bool> {
        let mut conn = self.pool.conn();
        let id = job_id.to_string();

        let Some(record) = self.try_get(job_id).await? else {
            // Keep indexes tidy even if the record is already gone
            conn.zrem(&self.finished_key(), &id)
                .await
                .map_err(Self::unavailable)?;
            return Ok(false);
        };

        conn.del(&self.record_key(job_id)).await.map_err(Self::unavailable)?;
        conn.srem(&self.state_key(record.state), &id)
            .await
            .map_err(Self::unavailable)?;
        conn.zrem(&self.finished_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        Ok(true)
    }
}
