//! One page of raw records returned by a page source.

use serde::{Deserialize, Serialize};

/// Opaque continuation token handed back to the source for the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(String);

impl PageCursor {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A page of raw records.
///
/// `cursor` addresses the *next* page and is only meaningful when
/// `has_next` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<serde_json::Value>,
    pub has_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<PageCursor>,
}

impl Page {
    /// Final page: no continuation.
    #[must_use]
    pub fn last(records: Vec<serde_json::Value>) -> Self {
        Self {
            records,
            has_next: false,
            cursor: None,
        }
    }

    /// Page followed by another one reachable through `cursor`.
    #[must_use]
    pub fn with_next(records: Vec<serde_json::Value>, cursor: PageCursor) -> Self {
        Self {
            records,
            has_next: true,
            cursor: Some(cursor),
        }
    }
}
