//! Redis backing for the job registry, the work queue, and the result cache
//!
//! One shared store carries all three roles; the only cross-role invariant
//! (at-most-one dispatch) is enforced by the registry's compare-and-set
//! script, not by anything the queue guarantees.

use crate::config::BackendConfig;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Store result type alias
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the Redis backing
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timeout waiting for backend")]
    Timeout,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

/// Shared Redis handle
///
/// Wraps a multiplexed [`ConnectionManager`] (which reconnects internally)
/// plus the configuration used to establish it. Cheap to clone.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    config: Arc<BackendConfig>,
}

impl RedisPool {
    /// Connect to the backend, retrying per the configured policy
    pub async fn connect(config: BackendConfig) -> StoreResult<Self> {
        let client = RedisClient::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut attempt = 0;
        let manager = loop {
            attempt += 1;
            debug!(attempt, "connecting to backend");

            match tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client.clone()))
                .await
            {
                Ok(Ok(manager)) => break manager,
                Ok(Err(e)) => {
                    error!(attempt, error = %e, "backend connection attempt failed");
                    if attempt >= config.max_retries {
                        return Err(StoreError::Connection(format!(
                            "failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }
                }
                Err(_) => {
                    error!(attempt, "backend connection attempt timed out");
                    if attempt >= config.max_retries {
                        return Err(StoreError::Timeout);
                    }
                }
            }

            tokio::time::sleep(config.retry_delay()).await;
        };

        let pool = Self {
            manager,
            config: Arc::new(config),
        };

        // Validate with a PING before handing the pool out
        pool.conn().ping().await?;
        info!(url = %pool.config.url, "backend connected");

        Ok(pool)
    }

    /// Get a connection handle
    pub fn conn(&self) -> RedisConnection {
        RedisConnection {
            manager: self.manager.clone(),
        }
    }

    /// Prefix a key with the configured namespace
    pub fn key(&self, suffix: impl AsRef<str>) -> String {
        format!("{}:{}", self.config.key_prefix, suffix.as_ref())
    }

    /// Whether the backend currently answers a PING
    pub async fn health_check(&self) -> bool {
        self.conn().ping().await.is_ok()
    }
}

/// Single multiplexed connection handle
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl RedisConnection {
    /// PING, validating the round trip
    pub async fn ping(&mut self) -> StoreResult<()> {
        let pong: String = redis::cmd("PING").query_async(&mut self.manager).await?;
        if pong != "PONG" {
            return Err(StoreError::Connection("unexpected PING reply".to_string()));
        }
        Ok(())
    }

    /// GET a key
    pub async fn get(&mut self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(redis::cmd("GET").arg(key).query_async(&mut self.manager).await?)
    }

    /// SET a key
    pub async fn set(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.manager)
            .await?;
        Ok(())
    }

    /// SET a key only if absent; returns whether the write happened
    pub async fn set_nx(&mut self, key: &str, value: &[u8]) -> StoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async(&mut self.manager)
            .await?;
        Ok(reply.is_some())
    }

    /// SET a key with TTL
    pub async fn setex(&mut self, key: &str, ttl_secs: u64, value: &[u8]) -> StoreResult<()> {
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut self.manager)
            .await?;
        Ok(())
    }

    /// DEL a key; returns whether anything was removed
    pub async fn del(&mut self, key: &str) -> StoreResult<bool> {
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut self.manager).await?;
        Ok(removed > 0)
    }

    /// EXISTS
    pub async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut self.manager).await?;
        Ok(n > 0)
    }

    /// INCR a counter
    pub async fn incr(&mut self, key: &str) -> StoreResult<i64> {
        Ok(redis::cmd("INCR").arg(key).query_async(&mut self.manager).await?)
    }

    /// INCRBYFLOAT
    pub async fn incr_by_float(&mut self, key: &str, by: f64) -> StoreResult<f64> {
        Ok(redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(by)
            .query_async(&mut self.manager)
            .await?)
    }

    /// HINCRBY
    pub async fn hincr(&mut self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        Ok(redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut self.manager)
            .await?)
    }

    /// HGETALL as a string map
    pub async fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut self.manager).await?)
    }

    /// LPUSH onto the head of a list
    pub async fn lpush(&mut self, key: &str, value: &str) -> StoreResult<i64> {
        Ok(redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.manager)
            .await?)
    }

    /// LLEN
    pub async fn llen(&mut self, key: &str) -> StoreResult<i64> {
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut self.manager).await?)
    }

    /// LMOVE src tail -> dst head; None when the source list is empty
    pub async fn lmove_tail_head(&mut self, src: &str, dst: &str) -> StoreResult<Option<String>> {
        Ok(redis::cmd("LMOVE")
            .arg(src)
            .arg(dst)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut self.manager)
            .await?)
    }

    /// LREM all occurrences of a value
    pub async fn lrem(&mut self, key: &str, value: &str) -> StoreResult<i64> {
        Ok(redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut self.manager)
            .await?)
    }

    /// ZADD one member
    pub async fn zadd(&mut self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.manager)
            .await?;
        Ok(())
    }

    /// ZREM one member; returns whether it was present
    pub async fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.manager)
            .await?;
        Ok(removed > 0)
    }

    /// Members with score <= max, bounded
    pub async fn zrangebyscore_upto(
        &mut self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.manager)
            .await?)
    }

    /// ZREMRANGEBYSCORE of members with score <= max
    pub async fn zremrangebyscore_upto(&mut self, key: &str, max: f64) -> StoreResult<i64> {
        Ok(redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut self.manager)
            .await?)
    }

    /// ZCOUNT of members with score >= min
    pub async fn zcount_from(&mut self, key: &str, min: f64) -> StoreResult<i64> {
        Ok(redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg("+inf")
            .query_async(&mut self.manager)
            .await?)
    }

    /// SADD
    pub async fn sadd(&mut self, key: &str, member: &str) -> StoreResult<()> {
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.manager)
            .await?;
        Ok(())
    }

    /// SREM
    pub async fn srem(&mut self, key: &str, member: &str) -> StoreResult<()> {
        let _: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.manager)
            .await?;
        Ok(())
    }

    /// SCARD
    pub async fn scard(&mut self, key: &str) -> StoreResult<i64> {
        Ok(redis::cmd("SCARD").arg(key).query_async(&mut self.manager).await?)
    }

    /// Up to `limit` random members of a set
    pub async fn srandmember(&mut self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        Ok(redis::cmd("SRANDMEMBER")
            .arg(key)
            .arg(limit as i64)
            .query_async(&mut self.manager)
            .await?)
    }

    /// Run a Lua script returning a status string
    pub async fn eval_script(
        &mut self,
        script: &redis::Script,
        keys: &[&str],
        args: &[&str],
    ) -> StoreResult<String> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        Ok(invocation.invoke_async(&mut self.manager).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests below require a local Redis; they no-op when none is reachable,
    /// mirroring how the rest of the backend-touching suites are written.
    async fn test_pool() -> Option<RedisPool> {
        RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            ..BackendConfig::default()
        })
        .await
        .ok()
    }

    #[tokio::test]
    async fn test_key_prefixing() {
        if let Some(pool) = test_pool().await {
            assert_eq!(pool.key("jobs:record:x"), "scribe:jobs:record:x");
        }
    }

    #[tokio::test]
    async fn test_set_get_del() {
        if let Some(pool) = test_pool().await {
            let mut conn = pool.conn();
            let key = pool.key("test:backend:set_get");

            conn.set(&key, b"value").await.unwrap();
            assert_eq!(conn.get(&key).await.unwrap(), Some(b"value".to_vec()));
            assert!(conn.del(&key).await.unwrap());
            assert_eq!(conn.get(&key).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_set_nx_is_idempotent_guard() {
        if let Some(pool) = test_pool().await {
            let mut conn = pool.conn();
            let key = pool.key("test:backend:setnx");
            let _ = conn.del(&key).await;

            assert!(conn.set_nx(&key, b"first").await.unwrap());
            assert!(!conn.set_nx(&key, b"second").await.unwrap());
            assert_eq!(conn.get(&key).await.unwrap(), Some(b"first".to_vec()));
            let _ = conn.del(&key).await;
        }
    }

    #[tokio::test]
    async fn test_list_move_round_trip() {
        if let Some(pool) = test_pool().await {
            let mut conn = pool.conn();
            let src = pool.key("test:backend:src");
            let dst = pool.key("test:backend:dst");
            let _ = conn.del(&src).await;
            let _ = conn.del(&dst).await;

            conn.lpush(&src, "a").await.unwrap();
            conn.lpush(&src, "b").await.unwrap();

            // Oldest entry comes off the tail first
            assert_eq!(conn.lmove_tail_head(&src, &dst).await.unwrap(), Some("a".to_string()));
            assert_eq!(conn.llen(&dst).await.unwrap(), 1);

            let _ = conn.del(&src).await;
            let _ = conn.del(&dst).await;
        }
    }
}
