//! scribe-core: the asynchronous transcription pipeline
//!
//! Clients submit audio over HTTP, get a job id back, and poll for status
//! and results. This crate holds everything behind that surface: the blob
//! store for uploaded audio, the Redis-backed job registry with its CAS
//! transition primitive, the content-addressed result cache, the FIFO work
//! queue with lease-based redelivery, token-bucket admission control, the
//! worker runtime driving the opaque transcription engine, the janitor, and
//! the telemetry counters operators scrape.

pub mod backend;
pub mod blob;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod jobs;
pub mod ratelimit;
pub mod services;
pub mod telemetry;
pub mod transcript;

// Re-export commonly used types
pub use backend::{RedisPool, StoreError};
pub use blob::{BlobStore, BlobWriter};
pub use cache::ResultCache;
pub use config::Config;
pub use engine::{CancelToken, EngineConfig, EngineError, MockEngine, TranscriptionEngine};
pub use error::{Error, Result};
pub use fingerprint::Fingerprinter;
pub use jobs::{
    Janitor, JobId, JobRecord, JobRegistry, JobState, SubmissionOptions, WorkQueue, Worker,
    WorkerId,
};
pub use ratelimit::{BucketKind, RateLimiter};
pub use services::{PollingService, ResultView, StatusView, SubmissionOutcome, SubmissionService};
pub use telemetry::{HealthReport, HealthStatus, RequestOutcome, Telemetry};
pub use transcript::{Segment, Transcript};

/// Current version of scribe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
