//! Polling service
//!
//! Serves status, result, and cancellation requests. Reads are short registry
//! and cache lookups; cancellation is the one write, performed through the
//! registry CAS so it composes safely with a worker racing on the same job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::cache::ResultCache;
use crate::jobs::{JobId, JobRecord, JobRegistry, JobState};
use crate::ratelimit::{BucketKind, RateLimiter};
use crate::transcript::Transcript;
use crate::{Error, Result};

const CANCEL_CAS_ATTEMPTS: usize = 3;

/// Status projection of a job record
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    /// Job identifier
    pub job_id: JobId,

    /// Current state
    pub state: JobState,

    /// Sanitized original filename
    pub filename: String,

    /// Submission time
    pub submitted_at: DateTime<Utc>,

    /// Claim time, once Processing has been entered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Claim count
    pub attempt: u32,

    /// Stable failure kind, when Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    /// Failure message, when Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<JobRecord> for StatusView {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            state: record.state,
            filename: record.filename,
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            attempt: record.attempt,
            error_kind: record.error_kind,
            error_message: record.error_message,
        }
    }
}

/// Outcome of a result request
#[derive(Debug, Clone)]
pub enum ResultView {
    /// Transcript available
    Ready(Transcript),

    /// Job has not reached Completed yet
    Pending { state: JobState },

    /// Job ended without a transcript; kind/message come from the record
    Terminal {
        state: JobState,
        error_kind: String,
        error_message: Option<String>,
    },
}

/// Read side of the job protocol
#[derive(Clone)]
pub struct PollingService {
    registry: JobRegistry,
    cache: ResultCache,
    blob: BlobStore,
    limiter: Arc<RateLimiter>,
}

impl PollingService {
    /// Wire the service to its collaborators
    pub fn new(
        registry: JobRegistry,
        cache: ResultCache,
        blob: BlobStore,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            registry,
            cache,
            blob,
            limiter,
        }
    }

    /// Current status of a job
    pub async fn get_status(&self, caller: &str, job_id: JobId) -> Result<StatusView> {
        self.limiter.try_acquire(BucketKind::Poll, caller)?;
        let record = self.registry.get(job_id).await?;
        Ok(record.into())
    }

    /// Transcript for a Completed job, or the current state otherwise
    pub async fn get_result(&self, caller: &str, job_id: JobId) -> Result<ResultView> {
        self.limiter.try_acquire(BucketKind::Poll, caller)?;
        let record = self.registry.get(job_id).await?;

        match record.state {
            JobState::Completed => {
                let handle = record.result_handle.ok_or_else(|| {
                    Error::Internal("completed job is missing its result handle".to_string())
                })?;
                match self.cache.lookup(&handle).await? {
                    Some(transcript) => Ok(ResultView::Ready(transcript)),
                    None => Err(Error::Gone(
                        "the cached transcript for this job has expired".to_string(),
                    )),
                }
            }
            JobState::Failed => Ok(ResultView::Terminal {
                state: record.state,
                error_kind: record
                    .error_kind
                    .unwrap_or_else(|| "Internal".to_string()),
                error_message: record.error_message,
            }),
            JobState::Cancelled => Ok(ResultView::Terminal {
                state: record.state,
                error_kind: "Cancelled".to_string(),
                error_message: None,
            }),
            state => Ok(ResultView::Pending { state }),
        }
    }

    /// Cancel a job that has not reached a terminal state
    ///
    /// Queued jobs are tombstoned outright: the worker that later reserves the
    /// id loses its claim CAS and skips execution. Processing jobs flip to
    /// Cancelled immediately too; the in-flight worker notices on its next
    /// registry poll and abandons the computation. Cancelling an already
    /// Cancelled job is a no-op that reports success.
    pub async fn cancel(&self, caller: &str, job_id: JobId) -> Result<JobState> {
        self.limiter.try_acquire(BucketKind::Poll, caller)?;

        for _ in 0..CANCEL_CAS_ATTEMPTS {
            let record = self.registry.get(job_id).await?;
            match record.state {
                JobState::Cancelled => return Ok(JobState::Cancelled),
                JobState::Completed | JobState::Failed => {
                    return Err(Error::NotCancellable(format!(
                        "job is already {}",
                        record.state
                    )));
                }
                current @ (JobState::Queued | JobState::Processing) => {
                    let mut cancelled = record.clone();
                    cancelled.mark_cancelled();
                    match self.registry.compare_and_set(current, &cancelled).await {
                        Ok(()) => {
                            // Terminal state: the blob is eligible for deletion now
                            if let Err(e) = self.blob.delete(job_id).await {
                                warn!(%job_id, error = %e, "failed to delete blob on cancel");
                            }
                            info!(%job_id, from = %current, "job cancelled");
                            return Ok(JobState::Cancelled);
                        }
                        Err(Error::StateMismatch { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(Error::Internal(
            "job state kept changing during cancellation".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedisPool;
    use crate::config::{BackendConfig, RateLimitConfig, ResultCacheConfig};
    use crate::engine::{CancelToken, MockEngine, TranscriptionEngine};
    use crate::jobs::SubmissionOptions;
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: JobRegistry,
        cache: ResultCache,
        service: PollingService,
    }

    async fn fixture() -> Option<Fixture> {
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
        let cache = ResultCache::new(pool, &ResultCacheConfig::default());
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));

        Some(Fixture {
            _dir: dir,
            registry: registry.clone(),
            cache: cache.clone(),
            service: PollingService::new(registry, cache, blob, limiter),
        })
    }

    fn queued_record() -> JobRecord {
        JobRecord::queued(
            Uuid::new_v4(),
            "ab".repeat(32),
            "talk.wav".to_string(),
            SubmissionOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_status_of_unknown_job_is_not_found() {
        if let Some(f) = fixture().await {
            let err = f.service.get_status("caller", Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_status_reflects_record() {
        if let Some(f) = fixture().await {
            let record = queued_record();
            f.registry.create(&record).await.unwrap();

            let status = f.service.get_status("caller", record.job_id).await.unwrap();
            assert_eq!(status.state, JobState::Queued);
            assert_eq!(status.filename, "talk.wav");
            assert_eq!(status.attempt, 0);
            assert!(status.started_at.is_none());

            f.registry.remove(record.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_result_pending_echoes_state() {
        if let Some(f) = fixture().await {
            let record = queued_record();
            f.registry.create(&record).await.unwrap();

            match f.service.get_result("caller", record.job_id).await.unwrap() {
                ResultView::Pending { state } => assert_eq!(state, JobState::Queued),
                other => panic!("unexpected view: {:?}", other),
            }

            f.registry.remove(record.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_result_ready_and_gone() {
        if let Some(f) = fixture().await {
            let mut record = queued_record();
            f.registry.create(&record).await.unwrap();
            record.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &record).await.unwrap();
            record.mark_completed();
            f.registry
                .compare_and_set(JobState::Processing, &record)
                .await
                .unwrap();

            // No cache entry yet: Completed but Gone
            let err = f.service.get_result("caller", record.job_id).await.unwrap_err();
            assert!(matches!(err, Error::Gone(_)));

            let transcript = MockEngine::canned()
                .transcribe(b"x", &SubmissionOptions::default(), &CancelToken::new())
                .unwrap();
            f.cache.put(&record.fingerprint, &transcript).await.unwrap();

            match f.service.get_result("caller", record.job_id).await.unwrap() {
                ResultView::Ready(t) => assert_eq!(t.text, transcript.text),
                other => panic!("unexpected view: {:?}", other),
            }

            f.registry.remove(record.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        if let Some(f) = fixture().await {
            let record = queued_record();
            f.registry.create(&record).await.unwrap();

            let state = f.service.cancel("caller", record.job_id).await.unwrap();
            assert_eq!(state, JobState::Cancelled);

            let stored = f.registry.get(record.job_id).await.unwrap();
            assert_eq!(stored.state, JobState::Cancelled);
            assert!(stored.finished_at.is_some());

            // Idempotent: cancelling again still reports success
            let again = f.service.cancel("caller", record.job_id).await.unwrap();
            assert_eq!(again, JobState::Cancelled);

            f.registry.remove(record.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_refused() {
        if let Some(f) = fixture().await {
            let mut record = queued_record();
            f.registry.create(&record).await.unwrap();
            record.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &record).await.unwrap();
            record.mark_failed("EngineError", "engine exploded");
            f.registry
                .compare_and_set(JobState::Processing, &record)
                .await
                .unwrap();

            let err = f.service.cancel("caller", record.job_id).await.unwrap_err();
            assert!(matches!(err, Error::NotCancellable(_)));

            f.registry.remove(record.job_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_result_surfaces_stored_kind() {
        if let Some(f) = fixture().await {
            let mut record = queued_record();
            f.registry.create(&record).await.unwrap();
            record.mark_claimed();
            f.registry.compare_and_set(JobState::Queued, &record).await.unwrap();
            record.mark_failed("DecodeError", "bad container header");
            f.registry
                .compare_and_set(JobState::Processing, &record)
                .await
                .unwrap();

            match f.service.get_result("caller", record.job_id).await.unwrap() {
                ResultView::Terminal {
                    state,
                    error_kind,
                    error_message,
                } => {
                    assert_eq!(state, JobState::Failed);
                    assert_eq!(error_kind, "DecodeError");
                    assert_eq!(error_message.as_deref(), Some("bad container header"));
                }
                other => panic!("unexpected view: {:?}", other),
            }

            f.registry.remove(record.job_id).await.unwrap();
        }
    }
}
