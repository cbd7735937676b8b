//! Error types for the console log core.

use thiserror::Error;

/// Errors that can occur in the console log core.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted record line could not be decoded.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A user-supplied range was rejected before commit.
    #[error("invalid {field} range: {reason}")]
    InvalidRange {
        /// Which range was being set.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A regular expression failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Configuration could not be applied.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for console operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;
