//! Transcription engine contract
//!
//! The engine is an external collaborator: an opaque blocking call from audio
//! bytes to a [`Transcript`], with a cooperative cancellation hook. One engine
//! instance is created per execution slot at worker start and is only ever
//! called serially from that slot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::jobs::SubmissionOptions;
use crate::transcript::Transcript;

/// Engine construction parameters, fixed for the life of a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine implementation selector
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Model identifier handed to the engine
    #[serde(default = "default_model")]
    pub model: String,

    /// Compute device ("cpu", "cuda", ...)
    #[serde(default = "default_device")]
    pub device: String,

    /// Numeric precision ("int8", "float16", ...)
    #[serde(default = "default_precision")]
    pub precision: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            model: default_model(),
            device: default_device(),
            precision: default_precision(),
        }
    }
}

fn default_kind() -> String {
    "mock".to_string()
}
fn default_model() -> String {
    "base".to_string()
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_precision() -> String {
    "int8".to_string()
}

/// Cooperative cancellation flag shared between a worker and its engine call
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an untripped token
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token; the engine must return promptly afterwards
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been tripped
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Errors an engine call can surface
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transcription cancelled")]
    Cancelled,

    #[error("audio decoding failed: {0}")]
    Decode(String),

    #[error("engine failure: {0}")]
    Engine(String),
}

impl From<EngineError> for crate::Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => crate::Error::Cancelled,
            EngineError::Decode(msg) => crate::Error::DecodeError(msg),
            EngineError::Engine(msg) => crate::Error::EngineError(msg),
        }
    }
}

/// The opaque `audio -> transcript` call
///
/// Implementations block the calling thread; workers run them on a dedicated
/// blocking thread. No thread-safety is assumed beyond serial calls from a
/// single slot.
pub trait TranscriptionEngine: Send + Sync {
    fn transcribe(
        &self,
        audio: &[u8],
        options: &SubmissionOptions,
        cancel: &CancelToken,
    ) -> Result<Transcript, EngineError>;
}

/// Canned-output engine used by tests and the `--mock-engine` worker flag
pub struct MockEngine {
    transcript: Transcript,
    delay: Duration,
}

impl MockEngine {
    /// Engine returning the given transcript immediately
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            delay: Duration::ZERO,
        }
    }

    /// Engine with a fixed canned transcript
    pub fn canned() -> Self {
        Self::new(Transcript {
            language: "en".to_string(),
            language_confidence: 0.99,
            duration: 1.2,
            processing_time: 0.0,
            text: "this is a canned transcript".to_string(),
            segments: vec![crate::transcript::Segment {
                start: 0.0,
                end: 1.2,
                text: "this is a canned transcript".to_string(),
                confidence: Some(0.99),
            }],
        })
    }

    /// Simulate a slow engine; cancellation is checked every 10 ms
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl TranscriptionEngine for MockEngine {
    fn transcribe(
        &self,
        audio: &[u8],
        options: &SubmissionOptions,
        cancel: &CancelToken,
    ) -> Result<Transcript, EngineError> {
        if audio.is_empty() {
            return Err(EngineError::Decode("empty audio stream".to_string()));
        }

        let started = Instant::now();
        let slice = Duration::from_millis(10);
        while started.elapsed() < self.delay {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            std::thread::sleep(slice.min(self.delay.saturating_sub(started.elapsed())));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut transcript = self.transcript.clone();
        if let Some(language) = options.language.as_deref().filter(|l| !l.is_empty()) {
            transcript.language = language.to_string();
            transcript.language_confidence = 1.0;
        }
        transcript.processing_time = started.elapsed().as_secs_f64();
        Ok(transcript)
    }
}
