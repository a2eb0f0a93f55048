//! Error types for a3s-relay

use thiserror::Error;

/// Errors that can occur in the relay
///
/// None of these are fatal to the process: storage errors surface to the
/// caller of the failing buffer operation, delivery errors are absorbed by
/// the circuit breaker and per-message backoff.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Persisted buffer could not be read or written
    #[error("Storage error at '{path}': {reason}")]
    Storage {
        path: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bus connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe {
        subject: String,
        reason: String,
    },

    /// Outbound HTTP transport failure (connect, timeout, reset)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Internal lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl RelayError {
    /// Build a storage error for the given path
    pub fn storage(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::Storage {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Http(format!("request timed out: {}", err))
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
