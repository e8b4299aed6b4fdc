//! Request-facing services
//!
//! Stateless coordinators over the blob store, registry, cache, and queue.
//! The HTTP layer stays thin; the whole submission and polling protocol
//! lives here so it can be tested without a server.

pub mod polling;
pub mod submission;

pub use polling::{PollingService, ResultView, StatusView};
pub use submission::{SubmissionOutcome, SubmissionService, StoredUpload, ALLOWED_MEDIA_TYPES};
