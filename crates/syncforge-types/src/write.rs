//! Keyed write operations consumed by persistence destinations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hierarchical destination key, `/`-separated (e.g. `despesas/204554/2023`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationKey(String);

impl DestinationKey {
    /// Create a key from a raw path. Leading/trailing separators are trimmed.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let path: String = path.into();
        Self(path.trim_matches('/').to_string())
    }

    /// Join non-empty segments with `/`.
    #[must_use]
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().trim_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    /// Append one segment.
    #[must_use]
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        Self::from_segments([self.0.as_str(), segment.as_ref()])
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last path segment, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Whether `self` lies under `prefix` (segment-wise).
    #[must_use]
    pub fn starts_with(&self, prefix: &DestinationKey) -> bool {
        if prefix.0.is_empty() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Whether `self` sits exactly one segment below `parent`.
    #[must_use]
    pub fn is_child_of(&self, parent: &DestinationKey) -> bool {
        self.starts_with(parent) && self.segments().count() == parent.segments().count() + 1
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Last-writer-wins upsert of the whole document.
    Set,
    /// Remove the document; removing an absent key is not an error.
    Delete,
}

impl WriteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
        }
    }
}

/// One keyed write. `payload` is ignored for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOperation {
    pub key: DestinationKey,
    pub kind: WriteKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WriteOperation {
    #[must_use]
    pub fn set(key: DestinationKey, payload: serde_json::Value) -> Self {
        Self {
            key,
            kind: WriteKind::Set,
            payload,
        }
    }

    #[must_use]
    pub fn delete(key: DestinationKey) -> Self {
        Self {
            key,
            kind: WriteKind::Delete,
            payload: serde_json::Value::Null,
        }
    }
}

/// A document as read back from a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: DestinationKey,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_trims_and_joins_segments() {
        let key = DestinationKey::from_segments(["/despesas/", "204554", "", "2023"]);
        assert_eq!(key.as_str(), "despesas/204554/2023");
        assert_eq!(key.leaf(), Some("2023"));
        assert_eq!(DestinationKey::new("/a/b/").as_str(), "a/b");
    }

    #[test]
    fn child_appends_segment() {
        let key = DestinationKey::new("despesas").child("204554");
        assert_eq!(key.as_str(), "despesas/204554");
    }

    #[test]
    fn starts_with_is_segment_aware() {
        let key = DestinationKey::new("despesas/204554/2023");
        assert!(key.starts_with(&DestinationKey::new("despesas/204554")));
        assert!(key.starts_with(&DestinationKey::new("despesas/204554/2023")));
        assert!(!key.starts_with(&DestinationKey::new("despesas/2045")));
        assert!(key.starts_with(&DestinationKey::new("")));
    }

    #[test]
    fn is_child_of_requires_exactly_one_more_segment() {
        let parent = DestinationKey::new("despesas/10");
        assert!(DestinationKey::new("despesas/10/2023").is_child_of(&parent));
        assert!(!DestinationKey::new("despesas/10/x/2023").is_child_of(&parent));
        assert!(!DestinationKey::new("despesas/10").is_child_of(&parent));
        assert!(!DestinationKey::new("despesas/100/2023").is_child_of(&parent));
    }

    #[test]
    fn delete_has_null_payload() {
        let op = WriteOperation::delete(DestinationKey::new("a/b"));
        assert_eq!(op.kind, WriteKind::Delete);
        assert!(op.payload.is_null());
    }
}
