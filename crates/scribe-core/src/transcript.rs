//! Transcript model
//!
//! The immutable payload stored in the result cache. Entries are written once
//! by a worker and never mutated; expiry is the only way one disappears.

use serde::{Deserialize, Serialize};

/// A completed transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Detected language code (ISO 639-1)
    pub language: String,

    /// Language detection confidence, 0..1
    pub language_confidence: f32,

    /// Total audio duration in seconds
    pub duration: f64,

    /// Wall-clock processing time in seconds
    pub processing_time: f64,

    /// Concatenated text of all segments
    pub text: String,

    /// Ordered segments
    pub segments: Vec<Segment>,
}

/// One timed span of transcribed speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment start in seconds
    pub start: f64,

    /// Segment end in seconds
    pub end: f64,

    /// Segment text
    pub text: String,

    /// Per-segment confidence, when the engine reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Transcript {
    /// Rebuild `text` from the segments
    pub fn join_segments(segments: &[Segment]) -> String {
        segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
