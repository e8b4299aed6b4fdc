//! Content fingerprinting
//!
//! The fingerprint keys the result cache and deduplicates work: SHA-256 over
//! the exact uploaded byte stream followed by the canonical rendering of the
//! options that materially affect output. Filename and caller identity are
//! deliberately excluded.

use sha2::{Digest, Sha256};

use crate::jobs::SubmissionOptions;

/// Incremental fingerprint builder
///
/// Feed upload chunks as they stream to the blob store, then fold in the
/// options once the form has been fully read.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    /// Start a fresh fingerprint
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Absorb an upload chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Fold in the option set and produce the hex digest
    pub fn finish(mut self, options: &SubmissionOptions) -> String {
        self.hasher.update(options.fingerprint_material().as_bytes());
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot fingerprint over a full buffer
pub fn fingerprint_bytes(bytes: &[u8], options: &SubmissionOptions) -> String {
    let mut fp = Fingerprinter::new();
    fp.update(bytes);
    fp.finish(options)
}
