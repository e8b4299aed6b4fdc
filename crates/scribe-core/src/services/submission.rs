//! Submission service
//!
//! Order matters here and is part of the contract: admission control first,
//! size and media-type checks before any byte is stored, streaming write with
//! incremental fingerprinting, then the cache consultation that decides
//! between the synchronous hit path and enqueueing real work.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::{sanitize_filename, BlobStore};
use crate::cache::ResultCache;
use crate::fingerprint::Fingerprinter;
use crate::jobs::{JobId, JobRecord, JobRegistry, JobState, SubmissionOptions, WorkQueue};
use crate::ratelimit::{BucketKind, RateLimiter};
use crate::telemetry::{RequestOutcome, Telemetry};
use crate::{Error, Result};

/// Declared media types accepted for upload
pub const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/mp4",
    "audio/m4a",
    "audio/x-m4a",
    "audio/flac",
    "audio/x-flac",
    "audio/ogg",
    "application/ogg",
    "audio/webm",
];

/// What the caller gets back from a submission
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// Newly assigned job id
    pub job_id: JobId,

    /// Queued on the miss path, Completed on a warm cache hit
    pub state: JobState,

    /// Whether the result came straight from the cache
    pub cache_hit: bool,
}

/// A finished streaming upload, pending finalization
pub struct StoredUpload {
    size: u64,
    fingerprinter: Fingerprinter,
}

impl StoredUpload {
    /// Bytes stored
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Entry point for new work
#[derive(Clone)]
pub struct SubmissionService {
    blob: BlobStore,
    registry: JobRegistry,
    cache: ResultCache,
    queue: WorkQueue,
    limiter: Arc<RateLimiter>,
    telemetry: Telemetry,
}

impl SubmissionService {
    /// Wire the service to its collaborators
    pub fn new(
        blob: BlobStore,
        registry: JobRegistry,
        cache: ResultCache,
        queue: WorkQueue,
        limiter: Arc<RateLimiter>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            blob,
            registry,
            cache,
            queue,
            limiter,
            telemetry,
        }
    }

    /// Step 1-2: admission token plus declared-length precheck
    ///
    /// Rejecting on the declared Content-Length keeps oversize bodies from
    /// being read at all; the streaming writer still enforces the cap for
    /// clients that lie.
    pub fn admit(&self, caller: &str, declared_len: Option<u64>) -> Result<()> {
        self.limiter.try_acquire(BucketKind::Submit, caller)?;

        let cap = self.blob.max_bytes();
        if let Some(len) = declared_len {
            if len > cap {
                return Err(Error::PayloadTooLarge { limit_bytes: cap });
            }
        }
        Ok(())
    }

    /// Step 3: declared media type must be in the accepted set
    pub fn validate_media_type(&self, content_type: &str) -> Result<()> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if ALLOWED_MEDIA_TYPES.contains(&essence.as_str()) {
            Ok(())
        } else {
            Err(Error::UnsupportedMedia(essence))
        }
    }

    /// Assign a fresh provisional job id
    pub fn new_job_id(&self) -> JobId {
        Uuid::new_v4()
    }

    /// Step 4: stream the body into the blob store, hashing as it goes
    pub async fn store_upload<S>(
        &self,
        job_id: JobId,
        filename: &str,
        mut body: S,
    ) -> Result<StoredUpload>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut writer = self.blob.writer(job_id, filename).await?;
        let mut fingerprinter = Fingerprinter::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.abort().await;
                    return Err(e);
                }
            };
            fingerprinter.update(&chunk);
            if let Err(e) = writer.write(&chunk).await {
                writer.abort().await;
                return Err(e);
            }
        }

        let size = writer.finish().await?;
        Ok(StoredUpload { size, fingerprinter })
    }

    /// Discard a provisional blob after a later validation failure
    pub async fn abort(&self, job_id: JobId) {
        if let Err(e) = self.blob.delete(job_id).await {
            warn!(%job_id, error = %e, "failed to discard provisional blob");
        }
    }

    /// Steps 5-7: consult the cache, enroll the record, enqueue on a miss
    pub async fn finalize(
        &self,
        job_id: JobId,
        filename: &str,
        options: SubmissionOptions,
        upload: StoredUpload,
    ) -> Result<SubmissionOutcome> {
        options.validate()?;
        let filename = sanitize_filename(filename);
        let fingerprint = upload.fingerprinter.finish(&options);

        let cached = match self.cache.lookup(&fingerprint).await {
            Ok(hit) => hit,
            Err(e) => {
                // Best-effort cache: treat an unreachable cache as a miss
                warn!(error = %e, "result cache lookup failed, treating as miss");
                None
            }
        };

        if cached.is_some() {
            self.abort(job_id).await;
            let record =
                JobRecord::completed_from_cache(job_id, fingerprint, filename, options);
            self.registry.create(&record).await?;
            self.telemetry.record_cache_hit().await;
            self.telemetry.record_request(RequestOutcome::Cached).await;
            info!(%job_id, "submission answered from result cache");
            return Ok(SubmissionOutcome {
                job_id,
                state: JobState::Completed,
                cache_hit: true,
            });
        }

        let record = JobRecord::queued(job_id, fingerprint, filename, options);
        self.registry.create(&record).await?;
        self.queue.push(job_id).await?;
        self.telemetry.record_cache_miss().await;
        self.telemetry.record_request(RequestOutcome::Submitted).await;
        info!(%job_id, size = upload.size, "job enqueued");

        Ok(SubmissionOutcome {
            job_id,
            state: JobState::Queued,
            cache_hit: false,
        })
    }

    /// Full submission in one call, for callers that already hold the body
    pub async fn submit<S>(
        &self,
        caller: &str,
        declared_len: Option<u64>,
        content_type: &str,
        filename: &str,
        options: SubmissionOptions,
        body: S,
    ) -> Result<SubmissionOutcome>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        self.admit(caller, declared_len)?;
        self.validate_media_type(content_type)?;
        options.validate()?;

        let job_id = self.new_job_id();
        let upload = self.store_upload(job_id, filename, body).await?;
        match self.finalize(job_id, filename, options, upload).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abort(job_id).await;
                Err(e)
            }
        }
    }

    /// Count a refused submission
    pub async fn record_rejection(&self) {
        self.telemetry.record_request(RequestOutcome::Rejected).await;
    }
}
