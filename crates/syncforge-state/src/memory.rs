//! In-memory destination for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use syncforge_types::write::{DestinationKey, StoredDocument, WriteKind, WriteOperation};

use crate::backend::{BucketReader, Destination, DEFAULT_MAX_BATCH_SIZE};
use crate::error::{self, StateError};

/// Ordered key/value store.
///
/// Batches are applied atomically. Failures can be injected by batch number
/// (1-based, counted across the store's lifetime) to exercise partial-commit
/// accounting; an injected failure applies nothing from that batch.
pub struct MemoryStore {
    name: String,
    max_batch_size: usize,
    documents: Mutex<BTreeMap<DestinationKey, serde_json::Value>>,
    fail_on: BTreeSet<usize>,
    batches_seen: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            documents: Mutex::new(BTreeMap::new()),
            fail_on: BTreeSet::new(),
            batches_seen: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Fail the given batch numbers (1-based).
    #[must_use]
    pub fn fail_on_batches(mut self, batches: impl IntoIterator<Item = usize>) -> Self {
        self.fail_on.extend(batches);
        self
    }

    /// Seed a document without counting a batch.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the store lock is poisoned.
    pub fn insert(&self, key: DestinationKey, payload: serde_json::Value) -> error::Result<()> {
        self.lock_docs()?.insert(key, payload);
        Ok(())
    }

    /// Read a single document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the store lock is poisoned.
    pub fn get(&self, key: &DestinationKey) -> error::Result<Option<serde_json::Value>> {
        Ok(self.lock_docs()?.get(key).cloned())
    }

    /// Number of stored documents.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the store lock is poisoned.
    pub fn len(&self) -> error::Result<usize> {
        Ok(self.lock_docs()?.len())
    }

    /// Whether the store holds no documents.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the store lock is poisoned.
    pub fn is_empty(&self) -> error::Result<bool> {
        Ok(self.lock_docs()?.is_empty())
    }

    /// Batches received so far, including failed ones.
    #[must_use]
    pub fn batches_seen(&self) -> usize {
        self.batches_seen.load(Ordering::SeqCst)
    }

    fn lock_docs(&self) -> error::Result<MutexGuard<'_, BTreeMap<DestinationKey, serde_json::Value>>> {
        self.documents.lock().map_err(|_| StateError::LockPoisoned)
    }
}

impl Destination for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn commit_batch(&self, ops: &[WriteOperation]) -> error::Result<()> {
        let batch = self.batches_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&batch) {
            return Err(StateError::Injected(format!(
                "batch {batch} rejected by '{}'",
                self.name
            )));
        }

        let mut docs = self.lock_docs()?;
        for op in ops {
            match op.kind {
                WriteKind::Set => {
                    docs.insert(op.key.clone(), op.payload.clone());
                }
                WriteKind::Delete => {
                    docs.remove(&op.key);
                }
            }
        }
        Ok(())
    }
}

impl BucketReader for MemoryStore {
    fn read_prefix(&self, prefix: &DestinationKey) -> error::Result<Vec<StoredDocument>> {
        let docs = self.lock_docs()?;
        Ok(docs
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, payload)| StoredDocument {
                key: key.clone(),
                payload: payload.clone(),
            })
            .collect())
    }
}
