//! Error types for `sbus` core library.

use thiserror::Error;

use crate::condition::{MessagingError, SessionErrorClass};

/// Result type alias using `sbus` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error types for `sbus` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied an out-of-range or otherwise unusable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error reported by the broker or the transport beneath it
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// A user message handler failed while processing a session message
    #[error("Message handler failed in session '{session_id}': {source}")]
    Handler {
        session_id: String,
        #[source]
        source: BoxError,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for the session runtime's backoff/escalation
    /// decisions. Only broker errors can fall into a steady-state class.
    pub const fn classify(&self) -> SessionErrorClass {
        match self {
            Self::Messaging(err) => err.classify(),
            _ => SessionErrorClass::Other,
        }
    }

    /// The broker condition behind this error, if any.
    pub const fn messaging(&self) -> Option<&MessagingError> {
        match self {
            Self::Messaging(err) => Some(err),
            _ => None,
        }
    }
}
