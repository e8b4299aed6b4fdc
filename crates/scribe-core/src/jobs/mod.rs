//! Job model and the asynchronous pipeline around it
//!
//! A job is one submission's lifecycle from acceptance to a terminal state.
//! The registry holds the durable record, the queue carries pending ids to
//! workers, and every state transition goes through the registry's
//! compare-and-set so that no two workers ever process the same job.

pub mod janitor;
pub mod queue;
pub mod registry;
pub mod worker;

pub use janitor::Janitor;
pub use queue::WorkQueue;
pub use registry::JobRegistry;
pub use worker::{Worker, WorkerId};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// Maximum accepted `initial_prompt` length in bytes
pub const MAX_INITIAL_PROMPT_BYTES: usize = 1024;

static LANGUAGE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2}$").unwrap());

/// Job lifecycle state
///
/// Legal transitions: Queued -> Processing -> {Completed, Failed};
/// {Queued, Processing} -> Cancelled; Processing -> Queued on a retryable
/// failure. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted and waiting in the work queue
    Queued,

    /// Claimed by exactly one worker
    Processing,

    /// Transcript published to the result cache
    Completed,

    /// Exhausted retries or hit a fatal error
    Failed,

    /// Tombstoned by a cancellation request
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "Queued"),
            JobState::Processing => write!(f, "Processing"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl JobState {
    /// Whether the state is a sink
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Whether cancellation is still permitted
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Processing)
    }

    /// Whether `from -> to` is a legal transition
    pub fn can_transition(from: JobState, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (from, to),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Queued)
        )
    }

    /// Lowercase name used in index keys and metrics labels
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Recognized submission options
///
/// All three participate in the fingerprint; two submissions differing only
/// in filename or caller identity hash identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOptions {
    /// Forced decoder language (ISO 639-1), empty/absent for auto-detect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Silence trimming toggle
    #[serde(default)]
    pub vad_filter: bool,

    /// Decoder bias prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
}

impl SubmissionOptions {
    /// Validate field shapes
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(language) = self.language.as_deref() {
            let normalized = language.trim().to_lowercase();
            if !normalized.is_empty() && !LANGUAGE_CODE.is_match(&normalized) {
                return Err(crate::Error::bad_request(format!(
                    "language must be a two-letter ISO 639-1 code, got {:?}",
                    language
                )));
            }
        }
        if let Some(prompt) = self.initial_prompt.as_deref() {
            if prompt.len() > MAX_INITIAL_PROMPT_BYTES {
                return Err(crate::Error::bad_request(format!(
                    "initial_prompt exceeds {} bytes",
                    MAX_INITIAL_PROMPT_BYTES
                )));
            }
        }
        Ok(())
    }

    /// Normalized language, empty string meaning auto-detect
    pub fn normalized_language(&self) -> String {
        self.language
            .as_deref()
            .map(|l| l.trim().to_lowercase())
            .unwrap_or_default()
    }

    /// Canonical byte string folded into the fingerprint
    pub fn fingerprint_material(&self) -> String {
        format!(
            "language={}\nvad_filter={}\ninitial_prompt={}",
            self.normalized_language(),
            if self.vad_filter { 1 } else { 0 },
            self.initial_prompt.as_deref().unwrap_or_default(),
        )
    }
}

/// Durable job record, the registry's unit of storage
///
/// Serialized atomically as one JSON document on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque 128-bit identifier assigned at submission
    pub job_id: JobId,

    /// Lifecycle state
    pub state: JobState,

    /// Content hash of the uploaded bytes plus fingerprint-affecting options
    pub fingerprint: String,

    /// Sanitized original filename, informational only
    pub filename: String,

    /// Wall-clock submission time
    pub submitted_at: DateTime<Utc>,

    /// Set when a worker claims the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set on reaching a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Recognized submission options
    pub options: SubmissionOptions,

    /// Claim count; >= 1 once Processing has been entered
    pub attempt: u32,

    /// Result-cache key, present iff Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_handle: Option<String>,

    /// Stable error kind, populated when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    /// Short human error message, populated when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobRecord {
    /// Fresh record in Queued state
    pub fn queued(
        job_id: JobId,
        fingerprint: String,
        filename: String,
        options: SubmissionOptions,
    ) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            fingerprint,
            filename,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            options,
            attempt: 0,
            result_handle: None,
            error_kind: None,
            error_message: None,
        }
    }

    /// Record enrolled directly as Completed on a cache hit
    pub fn completed_from_cache(
        job_id: JobId,
        fingerprint: String,
        filename: String,
        options: SubmissionOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            state: JobState::Completed,
            fingerprint: fingerprint.clone(),
            filename,
            submitted_at: now,
            started_at: None,
            finished_at: Some(now),
            options,
            attempt: 0,
            result_handle: Some(fingerprint),
            error_kind: None,
            error_message: None,
        }
    }

    /// Fields for the Queued -> Processing claim
    pub fn mark_claimed(&mut self) {
        self.state = JobState::Processing;
        self.started_at = Some(Utc::now());
        self.attempt += 1;
    }

    /// Fields for Processing -> Completed
    pub fn mark_completed(&mut self) {
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
        self.result_handle = Some(self.fingerprint.clone());
        self.error_kind = None;
        self.error_message = None;
    }

    /// Fields for Processing -> Failed
    pub fn mark_failed(&mut self, kind: &str, message: impl Into<String>) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.into());
    }

    /// Fields for {Queued, Processing} -> Cancelled
    pub fn mark_cancelled(&mut self) {
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
        self.error_kind = Some("Cancelled".to_string());
        self.error_message = None;
    }

    /// Fields for the Processing -> Queued retry reset
    pub fn mark_requeued(&mut self) {
        self.state = JobState::Queued;
        self.started_at = None;
    }

    /// Seconds from claim to finish, when both ends are known
    pub fn processing_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some(((finished - started).num_milliseconds() as f64 / 1000.0).max(0.0))
            }
            _ => None,
        }
    }
}
