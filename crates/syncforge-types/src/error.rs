//! Structured error model for page fetches.
//!
//! [`FetchError`] carries the failure kind, an optional HTTP-like status
//! code, and an optional retry-after hint. Construct via the kind-specific
//! factory methods; classification into retryable/fatal happens in the
//! engine's backoff policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad kind of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The source answered with a non-success status code.
    Http,
    /// The operation did not finish within its timeout.
    Timeout,
    /// The peer reset the connection.
    ConnectionReset,
    /// The peer refused the connection.
    ConnectionRefused,
    /// Any other transport-level failure.
    Transport,
    /// The response body could not be decoded.
    Decode,
    /// The item was never attempted because dispatch was stopped.
    Skipped,
    /// Unclassified failure.
    Other,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection_reset",
            Self::ConnectionRefused => "connection_refused",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Skipped => "skipped",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" {s}")).unwrap_or_default()
}

/// Failure of a single page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}{}] {message}", status_suffix(.status))]
pub struct FetchError {
    pub kind: FetchErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    /// Source-supplied hint for how long to wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl FetchError {
    fn new(kind: FetchErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Non-success response with an HTTP status code.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Http, Some(status), message)
    }

    /// Operation timed out.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, None, message)
    }

    /// Connection reset by peer.
    #[must_use]
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ConnectionReset, None, message)
    }

    /// Connection refused by peer.
    #[must_use]
    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ConnectionRefused, None, message)
    }

    /// Other transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transport, None, message)
    }

    /// Response body could not be decoded.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Decode, None, message)
    }

    /// Item skipped before its first attempt.
    #[must_use]
    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Skipped, None, message)
    }

    /// Unclassified failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Other, None, message)
    }

    /// Attach a retry-after hint (e.g. from an HTTP `Retry-After` header).
    #[must_use]
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }
}
