//! Reconciliation of newly fetched records with stored bucket state.
//!
//! Under [`SyncMode::Full`] a bucket that received new records is replaced
//! by exactly those records. Under [`SyncMode::Incremental`] it becomes the
//! union of stored and new records, the new record winning on an id
//! collision. Buckets that received nothing pass through untouched in both
//! modes; nothing is ever deleted.

use std::collections::{BTreeMap, BTreeSet};

use syncforge_types::record::{BucketKey, Record, RecordId};
use syncforge_types::state::SyncMode;

/// Records of one bucket, unique by id.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    pub key: BucketKey,
    pub records: BTreeMap<RecordId, Record>,
}

impl BucketState {
    #[must_use]
    pub fn empty(key: BucketKey) -> Self {
        Self {
            key,
            records: BTreeMap::new(),
        }
    }

    /// Insert or replace by id. Returns the replaced record.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Group records by bucket key. Later records replace earlier ones with the
/// same id.
pub fn bucketize(records: impl IntoIterator<Item = Record>) -> BTreeMap<BucketKey, BucketState> {
    let mut buckets: BTreeMap<BucketKey, BucketState> = BTreeMap::new();
    for record in records {
        buckets
            .entry(record.bucket)
            .or_insert_with(|| BucketState::empty(record.bucket))
            .insert(record);
    }
    buckets
}

/// Final bucket state for one entity plus merge accounting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconcileOutcome {
    /// Every bucket after reconciliation, touched or not.
    pub buckets: BTreeMap<BucketKey, BucketState>,
    /// Buckets that received new records and must be written.
    pub touched: BTreeSet<BucketKey>,
    /// New ids absent from stored state.
    pub added: u64,
    /// New ids that replaced a stored record.
    pub updated: u64,
    /// Stored records kept in touched buckets (incremental only).
    pub retained: u64,
}

impl ReconcileOutcome {
    /// Touched buckets in key order.
    pub fn touched_buckets(&self) -> impl Iterator<Item = &BucketState> {
        self.touched.iter().filter_map(|key| self.buckets.get(key))
    }
}

/// Merge `incoming` into `existing` under `mode`.
#[must_use]
pub fn reconcile(
    incoming: BTreeMap<BucketKey, BucketState>,
    mut existing: BTreeMap<BucketKey, BucketState>,
    mode: SyncMode,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for (key, new_state) in incoming {
        if new_state.is_empty() {
            continue;
        }
        let stored = existing.remove(&key).unwrap_or_else(|| BucketState::empty(key));

        for id in new_state.records.keys() {
            if stored.records.contains_key(id) {
                outcome.updated += 1;
            } else {
                outcome.added += 1;
            }
        }

        let merged = match mode {
            SyncMode::Full => new_state,
            SyncMode::Incremental => {
                let mut merged = stored;
                let before = merged.len();
                let mut replaced = 0usize;
                for (_, record) in new_state.records {
                    if merged.insert(record).is_some() {
                        replaced += 1;
                    }
                }
                outcome.retained += (before - replaced) as u64;
                merged
            }
        };

        outcome.touched.insert(key);
        outcome.buckets.insert(key, BucketState { key, ..merged });
    }

    outcome.buckets.extend(existing);
    outcome
}
