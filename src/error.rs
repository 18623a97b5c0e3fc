//! Error types for limiter operations.

use thiserror::Error;

use crate::store::{ReplyError, ScriptError};

/// Main error type for limiter operations.
///
/// A rejected request is not an error: it is reported through the `success`
/// flag of the response. Every variant here means the operation itself failed.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Capacity was zero
    #[error("capacity must be more than 0")]
    InvalidCapacity,

    /// Window or duration was zero
    #[error("duration must be more than 0")]
    InvalidDuration,

    /// The store failed to execute the script
    #[error("failed to execute {operation} script: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: ScriptError,
    },

    /// The store replied with something the limiter does not understand
    #[error("parsing {operation} reply: {source}")]
    Parse {
        operation: &'static str,
        #[source]
        source: ReplyError,
    },

    /// A timestamp could not be represented
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    pub(crate) fn backend(operation: &'static str, source: ScriptError) -> Self {
        Self::Backend { operation, source }
    }

    pub(crate) fn parse(operation: &'static str, source: ReplyError) -> Self {
        Self::Parse { operation, source }
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
