//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The envelope's `event_type` does not name its payload.
    #[error("envelope declares '{declared}' but carries '{payload}'")]
    TypeMismatch {
        declared: String,
        payload: &'static str,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
