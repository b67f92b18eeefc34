//! Error types for convostat-core

use thiserror::Error;

/// Main error type for the convostat-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-range event. The caller must fix the event.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Event sequence does not follow the aggregate's sequence number.
    ///
    /// Resolve with a reconcile, not a blind retry.
    #[error("stale event for user {user_id}: expected sequence {expected}, got {got}")]
    StaleEvent {
        user_id: String,
        expected: u64,
        got: u64,
    },

    /// Transient store failure (busy, locked, timed out)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// No aggregate stored for the user
    #[error("no aggregate for user: {0}")]
    NotFound(String),

    /// Stored aggregate violates an invariant
    #[error("corrupt aggregate for user {user_id}: {message}")]
    CorruptAggregate { user_id: String, message: String },
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

/// Result type alias for convostat-core
pub type Result<T> = std::result::Result<T, Error>;
