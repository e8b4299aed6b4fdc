//! Worker runtime
//!
//! Long-lived execution slot pulling from the work queue. The queue only
//! promises at-least-once delivery, so every reservation is followed by a
//! registry CAS claim; the slot that loses the claim acks and moves on, which
//! keeps dispatch at-most-once fleet-wide. The engine runs on a blocking
//! thread while the slot polls the registry for cancellation tombstones and
//! enforces the transcription ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::cache::ResultCache;
use crate::config::WorkerConfig;
use crate::engine::{CancelToken, EngineError, TranscriptionEngine};
use crate::jobs::{JobRecord, JobRegistry, JobState, WorkQueue};
use crate::telemetry::Telemetry;
use crate::{Error, Result};

/// Unique worker identifier
pub type WorkerId = Uuid;

/// One execution slot
pub struct Worker {
    /// Worker id, used in logs and heartbeats
    pub id: WorkerId,

    registry: JobRegistry,
    queue: WorkQueue,
    cache: ResultCache,
    blob: BlobStore,
    telemetry: Telemetry,
    engine: Arc<dyn TranscriptionEngine>,
    config: WorkerConfig,
}

impl Worker {
    /// Wire a slot to its collaborators
    pub fn new(
        registry: JobRegistry,
        queue: WorkQueue,
        cache: ResultCache,
        blob: BlobStore,
        telemetry: Telemetry,
        engine: Arc<dyn TranscriptionEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: WorkerId::new_v4(),
            registry,
            queue,
            cache,
            blob,
            telemetry,
            engine,
            config,
        }
    }

    /// Run the slot loop until the self-recycle threshold is reached
    ///
    /// Self-termination after a bounded number of jobs is policy, not
    /// correctness: the surrounding supervisor restarts the process and
    /// bounds memory growth.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.id, "worker slot started");
        let mut processed: u64 = 0;

        while processed < self.config.jobs_before_restart {
            self.telemetry.heartbeat(self.id).await;

            match self.queue.reserve(self.config.reserve_timeout()).await {
                Ok(Some(job_id)) => {
                    if self.process_one(job_id).await {
                        processed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "reserve failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = %self.id, processed, "worker slot recycling");
        Ok(())
    }

    /// Handle one delivery; returns whether this slot actually executed it
    pub async fn process_one(&self, job_id: Uuid) -> bool {
        let record = match self.registry.try_get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Record reaped or never created; drop the stale entry
                warn!(%job_id, "reserved id has no record, dropping");
                let _ = self.queue.ack(job_id).await;
                return false;
            }
            Err(e) => {
                error!(%job_id, error = %e, "registry read failed, requeueing");
                let _ = self.queue.nack(job_id, true).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                return false;
            }
        };

        if record.state != JobState::Queued {
            // Duplicate delivery or a tombstone; honour it without working
            if record.state.is_terminal() {
                let _ = self.blob.delete(job_id).await;
            }
            let _ = self.queue.ack(job_id).await;
            return false;
        }

        let mut claimed = record.clone();
        claimed.mark_claimed();
        match self.registry.compare_and_set(JobState::Queued, &claimed).await {
            Ok(()) => {}
            Err(Error::StateMismatch { actual, .. }) => {
                // Another slot won the claim, or a cancel landed first
                info!(%job_id, %actual, "claim lost, skipping");
                let _ = self.queue.ack(job_id).await;
                return false;
            }
            Err(e) => {
                error!(%job_id, error = %e, "claim CAS failed, requeueing");
                let _ = self.queue.nack(job_id, true).await;
                return false;
            }
        }

        info!(
            worker_id = %self.id,
            %job_id,
            attempt = claimed.attempt,
            "job claimed"
        );
        self.execute(claimed).await;
        true
    }

    /// Run a claimed job to a terminal state (or back to Queued on retry)
    async fn execute(&self, record: JobRecord) {
        let job_id = record.job_id;

        let audio = match self.blob.read(job_id).await {
            Ok(audio) => audio,
            Err(Error::BlobMissing(_)) => {
                self.fail(
                    &record,
                    "BlobMissing",
                    "the uploaded audio is no longer available",
                )
                .await;
                return;
            }
            Err(e) => {
                self.retry_or_fail(&record, Error::Io(std::io::Error::other(e.to_string())))
                    .await;
                return;
            }
        };

        let started = Instant::now();
        let cancel = CancelToken::new();
        let engine = Arc::clone(&self.engine);
        let options = record.options.clone();
        let engine_cancel = cancel.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || engine.transcribe(&audio, &options, &engine_cancel));

        let deadline = started + self.config.transcribe_timeout();
        let mut timed_out = false;
        let mut tombstoned = false;

        let outcome = loop {
            tokio::select! {
                joined = &mut handle => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(EngineError::Engine(format!("engine task died: {}", e))),
                    };
                }
                _ = tokio::time::sleep(self.config.cancel_poll()) => {
                    self.telemetry.heartbeat(self.id).await;

                    if !timed_out && Instant::now() >= deadline {
                        warn!(%job_id, "transcription ceiling reached, tripping cancel token");
                        cancel.cancel();
                        timed_out = true;
                    }
                    if !tombstoned && !timed_out {
                        if let Ok(Some(current)) = self.registry.try_get(job_id).await {
                            if current.state == JobState::Cancelled {
                                info!(%job_id, "cancellation observed, tripping cancel token");
                                cancel.cancel();
                                tombstoned = true;
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(mut transcript) => {
                transcript.processing_time = started.elapsed().as_secs_f64();
                self.complete(&record, transcript).await;
            }
            Err(EngineError::Cancelled) if tombstoned => {
                // The record is already Cancelled; just clean up the delivery
                let _ = self.blob.delete(job_id).await;
                let _ = self.queue.ack(job_id).await;
                info!(%job_id, "job abandoned after cancellation");
            }
            Err(EngineError::Cancelled) => {
                self.fail(
                    &record,
                    "Timeout",
                    format!(
                        "transcription exceeded the {}s ceiling",
                        self.config.transcribe_timeout_secs
                    ),
                )
                .await;
            }
            Err(e) => self.retry_or_fail(&record, e.into()).await,
        }
    }

    /// Publish the transcript and transition Processing -> Completed
    async fn complete(&self, record: &JobRecord, transcript: crate::transcript::Transcript) {
        let job_id = record.job_id;
        let duration = transcript.processing_time;

        if let Err(e) = self.cache.put(&record.fingerprint, &transcript).await {
            // Without a cache entry a Completed record would dangle. The
            // cache shares the registry backing, so the blip is transient
            warn!(%job_id, error = %e, "transcript publish failed");
            self.retry_or_fail(record, Error::RegistryUnavailable(e.to_string()))
                .await;
            return;
        }

        let mut done = record.clone();
        done.mark_completed();
        match self
            .registry
            .compare_and_set(JobState::Processing, &done)
            .await
        {
            Ok(()) => {
                self.telemetry.observe_duration(duration).await;
                let _ = self.blob.delete(job_id).await;
                let _ = self.queue.ack(job_id).await;
                info!(worker_id = %self.id, %job_id, duration_secs = duration, "job completed");
            }
            Err(Error::StateMismatch { actual, .. }) => {
                // A cancel landed while we were finishing; the transcript
                // stays cached, the record stays Cancelled
                info!(%job_id, %actual, "completion superseded");
                let _ = self.blob.delete(job_id).await;
                let _ = self.queue.ack(job_id).await;
            }
            Err(e) => {
                // Registry unreachable: leave the lease to expire so the
                // janitor redelivers, exactly as if this slot had crashed
                error!(%job_id, error = %e, "completion CAS failed, leaving lease");
            }
        }
    }

    /// Re-enqueue a transient failure below the attempt cap, else fail
    async fn retry_or_fail(&self, record: &JobRecord, err: Error) {
        let job_id = record.job_id;

        if err.is_retryable() && record.attempt < self.config.max_attempts {
            warn!(
                %job_id,
                attempt = record.attempt,
                max = self.config.max_attempts,
                error = %err,
                "transient failure, requeueing"
            );
            let mut requeued = record.clone();
            requeued.mark_requeued();
            match self
                .registry
                .compare_and_set(JobState::Processing, &requeued)
                .await
            {
                Ok(()) => {
                    let _ = self.queue.nack(job_id, true).await;
                }
                Err(Error::StateMismatch { .. }) => {
                    let _ = self.blob.delete(job_id).await;
                    let _ = self.queue.ack(job_id).await;
                }
                Err(e) => {
                    error!(%job_id, error = %e, "requeue CAS failed, leaving lease");
                }
            }
        } else {
            self.fail(record, err.kind(), client_message(&err)).await;
        }
    }

    /// Transition Processing -> Failed with a durable kind and message
    async fn fail(&self, record: &JobRecord, kind: &str, message: impl Into<String>) {
        let job_id = record.job_id;
        let message = message.into();
        warn!(%job_id, kind, %message, "job failed");

        let mut failed = record.clone();
        failed.mark_failed(kind, message);
        match self
            .registry
            .compare_and_set(JobState::Processing, &failed)
            .await
        {
            Ok(()) | Err(Error::StateMismatch { .. }) => {
                let _ = self.blob.delete(job_id).await;
                let _ = self.queue.ack(job_id).await;
            }
            Err(e) => {
                error!(%job_id, error = %e, "failure CAS failed, leaving lease");
            }
        }
    }
}

/// Failure message safe to store on the record and show to clients
fn client_message(err: &Error) -> String {
    match err {
        // IO errors can embed filesystem paths; keep those out of responses
        Error::Io(_) => "storage I/O failure while processing the audio".to_string(),
        Error::Internal(_) => "internal error while processing the audio".to_string(),
        other => other.to_string(),
    }
}
