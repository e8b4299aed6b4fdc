//! Work queue
//!
//! A Redis list of pending job ids (LPUSH head, LMOVE from tail) with a
//! companion processing list and a lease sorted-set scored by redelivery
//! deadline. Delivery is at-least-once: a worker that dies mid-job leaves its
//! lease to expire, and the janitor moves the entry back to pending. Dispatch
//! stays at-most-once because workers must still win the registry CAS before
//! doing any work.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::backend::RedisPool;
use crate::config::QueueConfig;
use crate::jobs::JobId;
use crate::{Error, Result};

/// FIFO queue of job ids pending execution
#[derive(Clone)]
pub struct WorkQueue {
    pool: RedisPool,
    config: QueueConfig,
}

impl WorkQueue {
    /// Create a queue handle
    pub fn new(pool: RedisPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    fn pending_key(&self) -> String {
        self.pool.key("queue:pending")
    }

    fn processing_key(&self) -> String {
        self.pool.key("queue:processing")
    }

    fn leases_key(&self) -> String {
        self.pool.key("queue:leases")
    }

    fn unavailable(e: crate::backend::StoreError) -> Error {
        Error::QueueUnavailable(e.to_string())
    }

    /// Configured delivery lease
    pub fn lease(&self) -> Duration {
        self.config.lease()
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Enqueue a job id exactly once per call
    pub async fn push(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.pool.conn();
        conn.lpush(&self.pending_key(), &job_id.to_string())
            .await
            .map_err(Self::unavailable)?;
        debug!(%job_id, "job enqueued");
        Ok(())
    }

    /// Claim the oldest pending entry, waiting up to `timeout`
    ///
    /// Returns `Ok(None)` when the queue stayed empty for the whole timeout;
    /// that is the normal idle case, not an error.
    pub async fn reserve(&self, timeout: Duration) -> Result<Option<JobId>> {
        let deadline = Instant::now() + timeout;
        let pending = self.pending_key();
        let processing = self.processing_key();
        let leases = self.leases_key();

        loop {
            let mut conn = self.pool.conn();
            if let Some(raw) = conn
                .lmove_tail_head(&pending, &processing)
                .await
                .map_err(Self::unavailable)?
            {
                let Ok(job_id) = raw.parse::<JobId>() else {
                    warn!(entry = %raw, "dropping malformed queue entry");
                    conn.lrem(&processing, &raw).await.map_err(Self::unavailable)?;
                    continue;
                };
                let lease_deadline = Self::now_secs() + self.config.lease().as_secs_f64();
                conn.zadd(&leases, lease_deadline, &raw)
                    .await
                    .map_err(Self::unavailable)?;
                return Ok(Some(job_id));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.config.reserve_poll().min(remaining)).await;
        }
    }

    /// Finalize a delivery
    pub async fn ack(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.pool.conn();
        let id = job_id.to_string();
        conn.lrem(&self.processing_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        conn.zrem(&self.leases_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    /// Finalize a delivery, optionally placing the id back at the tail
    pub async fn nack(&self, job_id: JobId, requeue: bool) -> Result<()> {
        let mut conn = self.pool.conn();
        let id = job_id.to_string();
        conn.lrem(&self.processing_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        conn.zrem(&self.leases_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        if requeue {
            conn.lpush(&self.pending_key(), &id)
                .await
                .map_err(Self::unavailable)?;
            debug!(%job_id, "job requeued");
        }
        Ok(())
    }

    /// Current number of pending entries
    pub async fn depth(&self) -> Result<i64> {
        let mut conn = self.pool.conn();
        conn.llen(&self.pending_key()).await.map_err(Self::unavailable)
    }

    /// Deliveries whose lease deadline has passed
    pub async fn expired_leases(&self, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.pool.conn();
        let members = conn
            .zrangebyscore_upto(&self.leases_key(), Self::now_secs(), limit)
            .await
            .map_err(Self::unavailable)?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    /// Take ownership of an expired lease; false when another reclaimer won
    pub async fn release_lease(&self, job_id: JobId) -> Result<bool> {
        let mut conn = self.pool.conn();
        conn.zrem(&self.leases_key(), &job_id.to_string())
            .await
            .map_err(Self::unavailable)
    }

    /// Move an entry from the processing list back to pending
    pub async fn requeue(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.pool.conn();
        let id = job_id.to_string();
        conn.lrem(&self.processing_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        conn.lpush(&self.pending_key(), &id)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    /// Drop an entry from the processing list without requeueing
    pub async fn drop_processing(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.pool.conn();
        conn.lrem(&self.processing_key(), &job_id.to_string())
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use uuid::Uuid;

    async fn test_queue() -> Option<WorkQueue> {
        let pool = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await
        .ok()?;
        Some(WorkQueue::new(pool, QueueConfig::default()))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        if let Some(queue) = test_queue().await {
            let first = Uuid::new_v4();
            let second = Uuid::new_v4();
            queue.push(first).await.unwrap();
            queue.push(second).await.unwrap();

            assert_eq!(queue.depth().await.unwrap(), 2);
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), Some(first));
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), Some(second));

            queue.ack(first).await.unwrap();
            queue.ack(second).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_reserve_waits_then_returns_none() {
        if let Some(queue) = test_queue().await {
            let started = Instant::now();
            let reserved = queue.reserve(Duration::from_millis(400)).await.unwrap();
            assert_eq!(reserved, None);
            assert!(started.elapsed() >= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_nack_requeue_places_at_tail() {
        if let Some(queue) = test_queue().await {
            let a = Uuid::new_v4();
            let b = Uuid::new_v4();
            queue.push(a).await.unwrap();
            queue.push(b).await.unwrap();

            let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(first, a);
            queue.nack(a, true).await.unwrap();

            // b was enqueued before the requeue, so it is served first
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), Some(b));
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), Some(a));
            queue.ack(a).await.unwrap();
            queue.ack(b).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_nack_drop_discards() {
        if let Some(queue) = test_queue().await {
            let id = Uuid::new_v4();
            queue.push(id).await.unwrap();
            queue.reserve(Duration::ZERO).await.unwrap();
            queue.nack(id, false).await.unwrap();
            assert_eq!(queue.depth().await.unwrap(), 0);
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_lease_reclaim_flow() {
        if let Some(pool) = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await
        .ok()
        {
            // Zero-length lease so the reservation expires immediately
            let queue = WorkQueue::new(
                pool,
                QueueConfig {
                    lease_secs: 0,
                    ..QueueConfig::default()
                },
            );

            let id = Uuid::new_v4();
            queue.push(id).await.unwrap();
            queue.reserve(Duration::ZERO).await.unwrap();

            let expired = queue.expired_leases(10).await.unwrap();
            assert_eq!(expired, vec![id]);

            assert!(queue.release_lease(id).await.unwrap());
            // Second reclaimer loses the race
            assert!(!queue.release_lease(id).await.unwrap());

            queue.requeue(id).await.unwrap();
            assert_eq!(queue.reserve(Duration::ZERO).await.unwrap(), Some(id));
            queue.ack(id).await.unwrap();
        }
    }
}
