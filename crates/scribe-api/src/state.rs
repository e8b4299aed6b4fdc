//! Shared application state

use std::sync::Arc;

use scribe_core::cache::ResultCache;
use scribe_core::jobs::{JobRegistry, WorkQueue};
use scribe_core::{
    BlobStore, Config, Error, PollingService, RateLimiter, RedisPool, SubmissionService, Telemetry,
};

/// Everything the request handlers share
#[derive(Clone)]
pub struct AppState {
    pub submission: SubmissionService,
    pub polling: PollingService,
    pub telemetry: Telemetry,
    pub registry: JobRegistry,
    pub queue: WorkQueue,
    pub blob: BlobStore,
    pub cache: ResultCache,
    pub config: Arc<Config>,
}

impl AppState {
    /// Connect the backing store and wire every service
    pub async fn from_config(config: Config) -> scribe_core::Result<Self> {
        let pool = RedisPool::connect(config.backend.clone())
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))?;
        Self::with_pool(config, pool)
    }

    /// Wire services over an existing pool
    pub fn with_pool(config: Config, pool: RedisPool) -> scribe_core::Result<Self> {
        let blob = BlobStore::from_config(&config.storage)?;
        let registry = JobRegistry::new(pool.clone());
        let cache = ResultCache::new(pool.clone(), &config.cache);
        let queue = WorkQueue::new(pool.clone(), config.queue.clone());
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let telemetry = Telemetry::new(pool);

        let submission = SubmissionService::new(
            blob.clone(),
            registry.clone(),
            cache.clone(),
            queue.clone(),
            Arc::clone(&limiter),
            telemetry.clone(),
        );
        let polling = PollingService::new(registry.clone(), cache.clone(), blob.clone(), limiter);

        Ok(Self {
            submission,
            polling,
            telemetry,
            registry,
            queue,
            blob,
            cache,
            config: Arc::new(config),
        })
    }
}
