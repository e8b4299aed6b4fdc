//! Content-addressed result cache
//!
//! Maps a fingerprint to a completed [`Transcript`] with a TTL. Entries are
//! written once and never mutated; they are present, absent, or expired. The
//! cache is best-effort: a miss says nothing about whether the work was ever
//! done. TTLs are not refreshed on read.

use std::time::Duration;
use tracing::debug;

use crate::backend::RedisPool;
use crate::config::ResultCacheConfig;
use crate::transcript::Transcript;
use crate::{Error, Result};

/// Result cache over the shared Redis backing
#[derive(Clone)]
pub struct ResultCache {
    pool: RedisPool,
    ttl: Duration,
}

impl ResultCache {
    /// Create a cache handle
    pub fn new(pool: RedisPool, config: &ResultCacheConfig) -> Self {
        Self {
            pool,
            ttl: config.ttl(),
        }
    }

    fn entry_key(&self, fingerprint: &str) -> String {
        self.pool.key(format!("results:{}", fingerprint))
    }

    /// Configured entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a transcript by fingerprint
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<Transcript>> {
        let mut conn = self.pool.conn();
        match conn
            .get(&self.entry_key(fingerprint))
            .await
            .map_err(|e| Error::Internal(format!("result cache read failed: {}", e)))?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Store a transcript under its fingerprint with the configured TTL
    pub async fn put(&self, fingerprint: &str, transcript: &Transcript) -> Result<()> {
        self.put_with_ttl(fingerprint, transcript, self.ttl).await
    }

    /// Store a transcript with an explicit TTL
    pub async fn put_with_ttl(
        &self,
        fingerprint: &str,
        transcript: &Transcript,
        ttl: Duration,
    ) -> Result<()> {
        let payload = serde_json::to_vec(transcript)?;
        let mut conn = self.pool.conn();
        conn.setex(&self.entry_key(fingerprint), ttl.as_secs().max(1), &payload)
            .await
            .map_err(|e| Error::Internal(format!("result cache write failed: {}", e)))?;
        debug!(fingerprint, ttl_secs = ttl.as_secs(), "transcript cached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::transcript::Segment;
    use uuid::Uuid;

    async fn test_cache() -> Option<ResultCache> {
        let pool = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await
        .ok()?;
        Some(ResultCache::new(pool, &ResultCacheConfig::default()))
    }

    fn transcript() -> Transcript {
        Transcript {
            language: "en".to_string(),
            language_confidence: 0.97,
            duration: 2.0,
            processing_time: 0.3,
            text: "cached words".to_string(),
            segments: vec![Segment {
                start: 0.0,
                end: 2.0,
                text: "cached words".to_string(),
                confidence: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        if let Some(cache) = test_cache().await {
            assert_eq!(cache.lookup(&"00".repeat(32)).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_put_then_lookup() {
        if let Some(cache) = test_cache().await {
            let fingerprint = "11".repeat(32);
            cache.put(&fingerprint, &transcript()).await.unwrap();

            let hit = cache.lookup(&fingerprint).await.unwrap().unwrap();
            assert_eq!(hit, transcript());

            // Reads are side-effect free: a second lookup is identical
            let again = cache.lookup(&fingerprint).await.unwrap().unwrap();
            assert_eq!(again, hit);
        }
    }

    #[tokio::test]
    async fn test_short_ttl_expires() {
        if let Some(cache) = test_cache().await {
            let fingerprint = "22".repeat(32);
            cache
                .put_with_ttl(&fingerprint, &transcript(), Duration::from_secs(1))
                .await
                .unwrap();
            assert!(cache.lookup(&fingerprint).await.unwrap().is_some());

            tokio::time::sleep(Duration::from_millis(1100)).await;
            assert_eq!(cache.lookup(&fingerprint).await.unwrap(), None);
        }
    }
}
