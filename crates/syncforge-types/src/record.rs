//! Record model: an opaque JSON payload plus the two fields the engine
//! reasons about, the record id and the bucket key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque record identifier, unique within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new record identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for RecordId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Grouping key for a record, derived once from its timestamp.
///
/// Serializes as the 4-digit year (`"2023"`) or `"unknown"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BucketKey {
    Year(u16),
    /// Sentinel for records whose timestamp is missing or unparseable.
    Unknown,
}

impl BucketKey {
    const UNKNOWN: &'static str = "unknown";

    #[must_use]
    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year(year) => write!(f, "{year:04}"),
            Self::Unknown => f.write_str(Self::UNKNOWN),
        }
    }
}

/// Error returned when a string is neither a 4-digit year nor `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bucket key '{0}'")]
pub struct ParseBucketKeyError(String);

impl FromStr for BucketKey {
    type Err = ParseBucketKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::UNKNOWN {
            return Ok(Self::Unknown);
        }
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseBucketKeyError(s.to_string()));
        }
        s.parse::<u16>()
            .map(Self::Year)
            .map_err(|_| ParseBucketKeyError(s.to_string()))
    }
}

impl TryFrom<String> for BucketKey {
    type Error = ParseBucketKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BucketKey> for String {
    fn from(value: BucketKey) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A transformed record: typed id and bucket, untyped payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub bucket: BucketKey,
    pub data: serde_json::Value,
}

impl Record {
    #[must_use]
    pub fn new(id: impl Into<RecordId>, bucket: BucketKey, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            bucket,
            data,
        }
    }
}
