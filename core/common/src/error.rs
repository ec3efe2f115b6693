//! Common error types for XRegion Sync.

use thiserror::Error;

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// User-fixable configuration problem for a single job.
    ///
    /// Raised for missing or invalid options, empty or ambiguous resource
    /// matches and regions that cannot be reached with the given credentials.
    #[error("The {job} configuration is invalid: {reason}")]
    Configuration { job: String, reason: String },

    /// Cloud provider call failed.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A sync marker tag value could not be decoded.
    #[error("Malformed sync marker: {0}")]
    MalformedMarker(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Anything else, including panics trapped by the batch runner.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Build a configuration error for the named job.
    pub fn configuration(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a user-fixable configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
