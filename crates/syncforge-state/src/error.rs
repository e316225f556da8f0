//! State backend error types.

/// Errors produced by destinations, bucket readers and the run ledger.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Destination key cannot be mapped onto this backend.
    #[error("invalid destination key '{0}'")]
    InvalidKey(String),

    /// Failure injected by a test double.
    #[error("injected failure: {0}")]
    Injected(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
