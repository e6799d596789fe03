//! Error types for the caching interceptor and the accounting pipeline.

use std::fmt;

/// Result type for every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for llm-cache-kit.
///
/// The enum is `Clone` because a single upstream failure inside a singleflight
/// group is handed to every waiter of that group.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Model output did not contain a well-formed JSON object.
    ///
    /// Raised when:
    /// - No `{` is present in the text
    /// - Brace matching never closes the first object
    /// - The located object is not valid JSON
    ///
    /// **Recovery:** Skip invoice persistence for this turn. The chat
    /// response itself is unaffected.
    ExtractionError(String),

    /// A single field failed validation.
    ///
    /// Raised for dates that are not `YYYY-MM-DD`, numbers that do not parse
    /// as decimals, and unknown fields in boundary edits.
    ValidationError {
        /// Name of the offending field
        field: String,
        /// Human readable reason
        message: String,
    },

    /// The upstream model call failed.
    ///
    /// Propagated unmodified to the caller. Never cached, never counted as
    /// savings.
    TransportError(String),

    /// An upstream stream ended before its terminal usage chunk.
    IncompleteStream(String),

    /// The in-flight computation was abandoned by its caller.
    Cancelled(String),

    /// A persistence gateway write or read failed.
    ///
    /// **Recovery:** Logged, not retried. Sibling writes that already
    /// succeeded are kept.
    PersistenceError(String),

    /// Configuration error: unknown model id in the pricing table or the
    /// provider registry, or an invalid configuration file.
    ConfigError(String),

    /// A cache entry was found under the request's fingerprint but its stored
    /// canonical request differs (hash collision).
    ///
    /// **Recovery:** Treated as a miss.
    IntegrityMismatch(String),

    /// Cache miss under `CacheStrategy::Fresh`.
    CacheMiss,

    /// Snapshot serialization failed.
    SerializationError(String),

    /// Snapshot deserialization failed.
    DeserializationError(String),

    /// Snapshot envelope has a bad magic header.
    InvalidCacheEntry(String),

    /// Snapshot was written by an incompatible schema version.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from the snapshot)
        found: u32,
    },

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Shorthand for a field-level validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ExtractionError(msg) => write!(f, "Extraction error: {}", msg),
            Error::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
            }
            Error::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Error::IncompleteStream(msg) => write!(f, "Incomplete stream: {}", msg),
            Error::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            Error::PersistenceError(msg) => write!(f, "Persistence error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::IntegrityMismatch(msg) => write!(f, "Integrity mismatch: {}", msg),
            Error::CacheMiss => write!(f, "Cache miss"),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Snapshot version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Other(e.to_string())
        } else if e.is_syntax() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(format!("I/O error: {}", e))
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("due_date", "expected YYYY-MM-DD");
        assert_eq!(
            err.to_string(),
            "Validation error on 'due_date': expected YYYY-MM-DD"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_error_clone_preserves_variant() {
        let err = Error::TransportError("503 from upstream".to_string());
        assert_eq!(err.clone(), err);
    }
}
