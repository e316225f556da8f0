//! Bucket documents: the persisted form of one entity's bucket.
//!
//! A bucket of entity `E` of resource `R` lives at key `R/E/<bucket>` and is
//! stored whole as
//! `{bucket, record_count, updated_at, records: [{id, bucket, data}]}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syncforge_types::record::{BucketKey, Record};
use syncforge_types::write::{DestinationKey, StoredDocument, WriteOperation};

use crate::reconcile::BucketState;

/// Serialized bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDocument {
    pub bucket: BucketKey,
    pub record_count: usize,
    pub updated_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

/// Why a stored document could not be read back as a bucket.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document '{key}' is not a bucket document: {source}")]
    Malformed {
        key: DestinationKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("document '{key}' holds bucket '{found}', expected '{expected}'")]
    BucketMismatch {
        key: DestinationKey,
        expected: String,
        found: BucketKey,
    },
}

/// `resource/entity`: prefix under which every bucket of an entity lives.
#[must_use]
pub fn entity_prefix(resource: &str, entity: &str) -> DestinationKey {
    DestinationKey::from_segments([resource, entity])
}

/// `resource/entity/bucket`.
#[must_use]
pub fn bucket_key_path(resource: &str, entity: &str, bucket: BucketKey) -> DestinationKey {
    entity_prefix(resource, entity).child(bucket.to_string())
}

impl BucketDocument {
    #[must_use]
    pub fn from_state(state: &BucketState, updated_at: DateTime<Utc>) -> Self {
        Self {
            bucket: state.key,
            record_count: state.records.len(),
            updated_at,
            records: state.records.values().cloned().collect(),
        }
    }

    /// Parse a stored document back into bucket state.
    ///
    /// Records are keyed by id; a duplicated id keeps its last occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError`] when the payload does not parse or its
    /// bucket disagrees with the key's last segment.
    pub fn decode(doc: &StoredDocument) -> Result<BucketState, DocumentError> {
        let parsed: Self =
            serde_json::from_value(doc.payload.clone()).map_err(|source| DocumentError::Malformed {
                key: doc.key.clone(),
                source,
            })?;
        if let Some(leaf) = doc.key.leaf() {
            if leaf != parsed.bucket.to_string() {
                return Err(DocumentError::BucketMismatch {
                    key: doc.key.clone(),
                    expected: leaf.to_string(),
                    found: parsed.bucket,
                });
            }
        }
        let records = parsed
            .records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<BTreeMap<_, _>>();
        Ok(BucketState {
            key: parsed.bucket,
            records,
        })
    }

    /// SET operation writing `state` at its key.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if a record payload cannot be encoded.
    pub fn write_operation(
        resource: &str,
        entity: &str,
        state: &BucketState,
        updated_at: DateTime<Utc>,
    ) -> Result<WriteOperation, serde_json::Error> {
        let payload = serde_json::to_value(Self::from_state(state, updated_at))?;
        Ok(WriteOperation::set(
            bucket_key_path(resource, entity, state.key),
            payload,
        ))
    }
}

/// Decode every stored bucket of the entity under `prefix`, skipping
/// documents that do not parse. Documents deeper than one segment below the
/// prefix belong to other keys and are ignored.
/// Returns the buckets and the number skipped.
#[must_use]
pub fn decode_entity(
    prefix: &DestinationKey,
    docs: &[StoredDocument],
) -> (BTreeMap<BucketKey, BucketState>, u64) {
    let entity = prefix.leaf().unwrap_or_default();
    let mut buckets = BTreeMap::new();
    let mut skipped = 0u64;
    for doc in docs.iter().filter(|doc| doc.key.is_child_of(prefix)) {
        match BucketDocument::decode(doc) {
            Ok(state) => {
                buckets.insert(state.key, state);
            }
            Err(e) => {
                skipped += 1;
                tracing::warn!(entity, key = doc.key.as_str(), error = %e, "Skipping unreadable bucket document");
            }
        }
    }
    (buckets, skipped)
}
