use std::fmt;

/// Main error type for scribe
///
/// Every variant maps to a stable `kind` string surfaced to clients and
/// operators, plus an HTTP status code for the API layer. Messages are short
/// human sentences and must not leak filesystem paths or stack traces.
#[derive(Debug)]
pub enum Error {
    /// Caller exhausted a rate-limit bucket; carries the suggested retry delay
    RateLimited { retry_after_secs: u64 },

    /// Upload exceeds the configured size cap
    PayloadTooLarge { limit_bytes: u64 },

    /// Declared media type is not in the accepted set
    UnsupportedMedia(String),

    /// Malformed request (bad field, unknown option, missing file part)
    BadRequest(String),

    /// Job id (or other resource) does not exist
    NotFound(String),

    /// Job completed but the cached transcript has expired
    Gone(String),

    /// Cancellation requested on a job in a terminal state
    NotCancellable(String),

    /// Registry compare-and-set lost the race (internal)
    StateMismatch { expected: String, actual: String },

    /// Worker found no blob for a claimed job
    BlobMissing(String),

    /// Audio could not be decoded
    DecodeError(String),

    /// The transcription engine reported a failure
    EngineError(String),

    /// An operation exceeded its deadline
    Timeout(String),

    /// The job was cancelled
    Cancelled,

    /// Filesystem errors from the blob store
    Io(std::io::Error),

    /// Work queue backend unreachable
    QueueUnavailable(String),

    /// Job registry backend unreachable
    RegistryUnavailable(String),

    /// Record (de)serialization errors
    Serialization(serde_json::Error),

    /// Configuration errors
    Config(String),

    /// Anything else
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RateLimited { retry_after_secs } => {
                write!(f, "Rate limit exceeded, retry in {}s", retry_after_secs)
            }
            Error::PayloadTooLarge { limit_bytes } => {
                write!(f, "Upload exceeds the {} byte limit", limit_bytes)
            }
            Error::UnsupportedMedia(msg) => write!(f, "Unsupported media type: {}", msg),
            Error::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Gone(msg) => write!(f, "No longer available: {}", msg),
            Error::NotCancellable(msg) => write!(f, "Not cancellable: {}", msg),
            Error::StateMismatch { expected, actual } => {
                write!(f, "State mismatch: expected {}, found {}", expected, actual)
            }
            Error::BlobMissing(msg) => write!(f, "Audio blob missing: {}", msg),
            Error::DecodeError(msg) => write!(f, "Audio decoding failed: {}", msg),
            Error::EngineError(msg) => write!(f, "Transcription engine error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::QueueUnavailable(msg) => write!(f, "Work queue unavailable: {}", msg),
            Error::RegistryUnavailable(msg) => write!(f, "Job registry unavailable: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl Error {
    /// Stable error kind string, part of the wire contract
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RateLimited { .. } => "RateLimited",
            Error::PayloadTooLarge { .. } => "PayloadTooLarge",
            Error::UnsupportedMedia(_) => "UnsupportedMedia",
            Error::BadRequest(_) => "BadRequest",
            Error::NotFound(_) => "NotFound",
            Error::Gone(_) => "Gone",
            Error::NotCancellable(_) => "NotCancellable",
            Error::StateMismatch { .. } => "StateMismatch",
            Error::BlobMissing(_) => "BlobMissing",
            Error::DecodeError(_) => "DecodeError",
            Error::EngineError(_) => "EngineError",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::Io(_) => "IOError",
            Error::QueueUnavailable(_) => "QueueUnavailable",
            Error::RegistryUnavailable(_) => "RegistryUnavailable",
            Error::Serialization(_) => "Internal",
            Error::Config(_) => "Internal",
            Error::Internal(_) => "Internal",
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RateLimited { .. } => 429,
            Error::PayloadTooLarge { .. } => 413,
            Error::UnsupportedMedia(_) => 415,
            Error::BadRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::Gone(_) => 410,
            Error::NotCancellable(_) => 409,
            Error::StateMismatch { .. } => 409,
            Error::Timeout(_) => 408,
            Error::Cancelled => 409,
            Error::QueueUnavailable(_) => 503,
            Error::RegistryUnavailable(_) => 503,
            Error::BlobMissing(_)
            | Error::DecodeError(_)
            | Error::EngineError(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Suggested retry delay, populated for rate-limit refusals
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Whether a worker should re-enqueue the job after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::DecodeError(_)
                | Error::QueueUnavailable(_)
                | Error::RegistryUnavailable(_)
        )
    }

    /// Create a bad-request error
    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        Error::BadRequest(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(Error::RateLimited { retry_after_secs: 5 }.kind(), "RateLimited");
        assert_eq!(Error::PayloadTooLarge { limit_bytes: 1 }.kind(), "PayloadTooLarge");
        assert_eq!(Error::Io(std::io::Error::other("x")).kind(), "IOError");
        assert_eq!(Error::Cancelled.kind(), "Cancelled");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::RateLimited { retry_after_secs: 1 }.status_code(), 429);
        assert_eq!(Error::PayloadTooLarge { limit_bytes: 1 }.status_code(), 413);
        assert_eq!(Error::UnsupportedMedia("text/html".into()).status_code(), 415);
        assert_eq!(Error::not_found("job").status_code(), 404);
        assert_eq!(Error::Gone("expired".into()).status_code(), 410);
        assert_eq!(Error::NotCancellable("done".into()).status_code(), 409);
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        assert_eq!(Error::RateLimited { retry_after_secs: 12 }.retry_after(), Some(12));
        assert_eq!(Error::bad_request("nope").retry_after(), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::DecodeError("bad header".into()).is_retryable());
        assert!(Error::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!Error::EngineError("assert".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
