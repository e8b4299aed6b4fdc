//! Scheduler / janitor
//!
//! Three periodic duties: sweep blobs whose job is terminal (or which are
//! older than the hard cap), purge finished job records past the retention
//! interval, and sample queue depth while reclaiming expired delivery leases.
//! Every task is idempotent, so running more than one janitor is harmless.

use std::time::SystemTime;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::config::{JanitorConfig, RegistryConfig};
use crate::jobs::{JobRegistry, JobState, WorkQueue};
use crate::Result;

const REAP_BATCH: usize = 1000;
const RECLAIM_BATCH: usize = 100;

/// Periodic cleanup loop
pub struct Janitor {
    registry: JobRegistry,
    queue: WorkQueue,
    blob: BlobStore,
    config: JanitorConfig,
    retention: RegistryConfig,
}

impl Janitor {
    /// Wire the janitor to its collaborators
    pub fn new(
        registry: JobRegistry,
        queue: WorkQueue,
        blob: BlobStore,
        config: JanitorConfig,
        retention: RegistryConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            blob,
            config,
            retention,
        }
    }

    /// Run all periodic tasks until the process exits
    pub async fn run(&self) {
        info!(
            blob_sweep_secs = self.config.blob_sweep_secs,
            reaper_secs = self.config.reaper_secs,
            depth_sample_secs = self.config.depth_sample_secs,
            "janitor started"
        );

        let mut blob_tick = interval(self.config.blob_sweep());
        let mut reap_tick = interval(self.config.reaper());
        let mut depth_tick = interval(self.config.depth_sample());

        loop {
            tokio::select! {
                _ = blob_tick.tick() => {
                    if let Err(e) = self.sweep_blobs().await {
                        error!(error = %e, "blob sweep failed");
                    }
                }
                _ = reap_tick.tick() => {
                    if let Err(e) = self.reap_jobs().await {
                        error!(error = %e, "job reaper failed");
                    }
                    if let Err(e) = self.reclaim_stuck_jobs().await {
                        error!(error = %e, "stuck-job reclaim failed");
                    }
                }
                _ = depth_tick.tick() => {
                    self.sample_depth().await;
                    if let Err(e) = self.reclaim_leases().await {
                        error!(error = %e, "lease reclaim failed");
                    }
                }
            }
        }
    }

    /// Delete blobs for terminal jobs, plus anything past the hard cap
    pub async fn sweep_blobs(&self) -> Result<usize> {
        let hard_cutoff = SystemTime::now() - self.config.blob_hard_cap();
        let mut removed = 0;

        for entry in self.blob.list().await? {
            let past_hard_cap = entry.modified < hard_cutoff;

            let deletable = match self.registry.try_get(entry.job_id).await {
                Ok(Some(record)) => record.state.is_terminal() || past_hard_cap,
                // Record already reaped (or never enrolled): only force past
                // the hard cap, so an in-flight upload is never swept away
                Ok(None) => past_hard_cap,
                Err(e) => {
                    warn!(job_id = %entry.job_id, error = %e, "skipping blob, registry unreachable");
                    false
                }
            };

            if deletable {
                match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(job_id = %entry.job_id, error = %e, "blob removal failed"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "blob sweep finished");
        }
        Ok(removed)
    }

    /// Purge finished records older than the retention interval
    pub async fn reap_jobs(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(self.retention.retention_secs as i64);
        let mut removed = 0;

        for job_id in self.registry.finished_before(cutoff, REAP_BATCH).await? {
            if self.registry.remove(job_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "job reaper finished");
        }
        Ok(removed)
    }

    /// Requeue deliveries whose worker died holding the lease
    pub async fn reclaim_leases(&self) -> Result<usize> {
        let mut reclaimed = 0;

        for job_id in self.queue.expired_leases(RECLAIM_BATCH).await? {
            // Only the reclaimer that removes the lease acts on it
            if !self.queue.release_lease(job_id).await? {
                continue;
            }

            match self.registry.try_get(job_id).await {
                Ok(Some(record)) if record.state == JobState::Processing => {
                    let mut requeued = record.clone();
                    requeued.mark_requeued();
                    match self
                        .registry
                        .compare_and_set(JobState::Processing, &requeued)
                        .await
                    {
                        Ok(()) => {
                            self.queue.requeue(job_id).await?;
                            reclaimed += 1;
                            warn!(%job_id, attempt = record.attempt, "stale lease reclaimed");
                        }
                        Err(_) => {
                            self.queue.drop_processing(job_id).await?;
                        }
                    }
                }
                // Reserved but never claimed: hand it back as-is
                Ok(Some(record)) if record.state == JobState::Queued => {
                    self.queue.requeue(job_id).await?;
                    reclaimed += 1;
                }
                _ => {
                    self.queue.drop_processing(job_id).await?;
                }
            }
        }

        Ok(reclaimed)
    }

    /// Reset Processing records whose claim has clearly been lost
    ///
    /// Lease reclaim covers a worker that died between reserve and ack; this
    /// covers the narrower window where the lease was already released but
    /// the reclaim itself died before the record went back to Queued. The
    /// attempt fence in the registry CAS keeps a merely-slow worker from
    /// colliding with the re-dispatch.
    pub async fn reclaim_stuck_jobs(&self) -> Result<usize> {
        let horizon = self.queue.lease() * 2;
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(horizon)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut reclaimed = 0;

        for job_id in self
            .registry
            .list_by_state(JobState::Processing, RECLAIM_BATCH)
            .await?
        {
            let Some(record) = self.registry.try_get(job_id).await? else {
                continue;
            };
            if record.state != JobState::Processing {
                continue;
            }
            if record.started_at.map(|t| t >= cutoff).unwrap_or(false) {
                continue;
            }

            let mut requeued = record.clone();
            requeued.mark_requeued();
            if self
                .registry
                .compare_and_set(JobState::Processing, &requeued)
                .await
                .is_ok()
            {
                self.queue.push(job_id).await?;
                reclaimed += 1;
                warn!(%job_id, "stuck job reset to Queued");
            }
        }

        Ok(reclaimed)
    }

    /// Log the sampled queue depth; the gauge itself is read at scrape time
    pub async fn sample_depth(&self) {
        match self.queue.depth().await {
            Ok(depth) => debug!(depth, "queue depth sampled"),
            Err(e) => warn!(error = %e, "queue depth sample failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedisPool;
    use crate::config::{BackendConfig, QueueConfig};
    use crate::jobs::{JobRecord, SubmissionOptions};
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: JobRegistry,
        queue: WorkQueue,
        blob: BlobStore,
        janitor: Janitor,
    }

    async fn fixture(lease_secs: u64, retention_secs: u64) -> Option<Fixture> {
        let pool = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await
        .ok()?;

        let dir = tempfile::tempdir().unwrap();
        let blob = BlobStore::new(dir.path(), 1024 * 1024).unwrap();
        let registry = JobRegistry::new(pool.clone());
        let queue = WorkQueue::new(
            pool.clone(),
            QueueConfig {
                lease_secs,
                ..QueueConfig::default()
            },
        );
        let janitor = Janitor::new(
            registry.clone(),
            queue.clone(),
            blob.clone(),
            JanitorConfig::default(),
            RegistryConfig { retention_secs },
        );

        Some(Fixture {
            _dir: dir,
            registry,
            queue,
            blob,
            janitor,
        })
    }

    fn record() -> JobRecord {
        JobRecord::queued(
            Uuid::new_v4(),
            "cd".repeat(32),
            "talk.wav".to_string(),
            SubmissionOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_sweep_deletes_terminal_job_blobs() {
        if let Some(f) = fixture(660, 86400).await {
            let mut done = record();
            f.blob.put(done.job_id, "talk.wav", b"bytes").await.unwrap();
            f.registry.create(&done).await.unwrap();
            done.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &done).await.unwrap();
            done.mark_completed();
            f.registry
                .compare_and_set(JobState::Processing, &done)
                .await
                .unwrap();

            assert_eq!(f.janitor.sweep_blobs().await.unwrap(), 1);
            assert!(f.blob.read(done.job_id).await.is_err());

            f.registry.remove(done.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_job_blobs() {
        if let Some(f) = fixture(660, 86400).await {
            let queued = record();
            f.blob.put(queued.job_id, "talk.wav", b"bytes").await.unwrap();
            f.registry.create(&queued).await.unwrap();

            assert_eq!(f.janitor.sweep_blobs().await.unwrap(), 0);
            assert!(f.blob.read(queued.job_id).await.is_ok());

            f.registry.remove(queued.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reaper_respects_retention() {
        if let Some(f) = fixture(660, 86400).await {
            let mut done = record();
            f.registry.create(&done).await.unwrap();
            done.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &done).await.unwrap();
            done.mark_completed();
            f.registry
                .compare_and_set(JobState::Processing, &done)
                .await
                .unwrap();

            // Fresh finish: retention keeps it
            assert_eq!(f.janitor.reap_jobs().await.unwrap(), 0);
            assert!(f.registry.try_get(done.job_id).await.unwrap().is_some());

            f.registry.remove(done.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reaper_purges_past_retention() {
        if let Some(f) = fixture(660, 0).await {
            let mut done = record();
            f.registry.create(&done).await.unwrap();
            done.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &done).await.unwrap();
            done.mark_completed();
            f.registry
                .compare_and_set(JobState::Processing, &done)
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(1100)).await;
            assert!(f.janitor.reap_jobs().await.unwrap() >= 1);
            assert!(f.registry.try_get(done.job_id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_stuck_processing_job_is_reset() {
        if let Some(f) = fixture(0, 86400).await {
            let mut claimed = record();
            f.registry.create(&claimed).await.unwrap();
            claimed.mark_claimed();
            f.registry
                .compare_and_set(JobState::Queued, &claimed)
                .await
                .unwrap();

            // No queue entry and no lease: the job is orphaned in Processing
            assert_eq!(f.janitor.reclaim_stuck_jobs().await.unwrap(), 1);

            let stored = f.registry.get(claimed.job_id).await.unwrap();
            assert_eq!(stored.state, JobState::Queued);
            assert_eq!(
                f.queue.reserve(Duration::ZERO).await.unwrap(),
                Some(claimed.job_id)
            );

            f.queue.ack(claimed.job_id).await.unwrap();
            f.registry.remove(claimed.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reclaim_requeues_crashed_worker_job() {
        if let Some(f) = fixture(0, 86400).await {
            let mut claimed = record();
            f.registry.create(&claimed).await.unwrap();
            f.queue.push(claimed.job_id).await.unwrap();

            // Simulate a worker that reserved, claimed, then died
            let reserved = f.queue.reserve(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(reserved, claimed.job_id);
            claimed.mark_claimed();
            f.registry
                .compare_and_set(JobState::Queued, &claimed)
                .await
                .unwrap();

            assert_eq!(f.janitor.reclaim_leases().await.unwrap(), 1);

            // Back to Queued with the attempt preserved, redeliverable
            let stored = f.registry.get(claimed.job_id).await.unwrap();
            assert_eq!(stored.state, JobState::Queued);
            assert_eq!(stored.attempt, 1);
            assert_eq!(
                f.queue.reserve(Duration::ZERO).await.unwrap(),
                Some(claimed.job_id)
            );

            f.queue.ack(claimed.job_id).await.unwrap();
            f.registry.remove(claimed.job_id).await.unwrap();
        }
    }
}
