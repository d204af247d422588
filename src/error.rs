//! Error types for dream-core.

use thiserror::Error;

/// Result type alias using dream-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during play and consolidation.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure talking to the LLM endpoint.
    ///
    /// `retryable` distinguishes transient faults (connection reset/refused,
    /// 5xx, generic network) from terminal ones (malformed framing).
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The LLM call exceeded its caller-supplied timeout. Never retried.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The remote reported a non-stop finish reason; the text is incomplete.
    #[error("Incomplete response: finish reason was '{finish_reason}'")]
    Incomplete { finish_reason: String },

    /// The model output could not be decoded into a move.
    #[error("Parse failure: {0}")]
    Parse(String),

    /// Persistence I/O or serialisation failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a terminal (non-retryable) transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether the client may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                retryable: true,
                ..
            }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
