//! Storage contracts.
//!
//! [`Destination`] receives batches of keyed writes, [`BucketReader`] reads
//! previously written documents back for incremental reconciliation, and
//! [`RunLedger`] keeps run history and the failed-item log. Model types live
//! in [`syncforge_types`].

use syncforge_types::state::{FailedItem, RunStats, SyncMode};
use syncforge_types::write::{DestinationKey, StoredDocument, WriteOperation};

use crate::error;

/// Batch cap applied when a destination is not configured otherwise.
///
/// Matches the per-commit write limit of common remote document stores.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Write side of a persistence backend.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Destination>`.
/// Calls may block; async callers are expected to move them off the executor.
pub trait Destination: Send + Sync {
    /// Stable name used in logs and per-destination results.
    fn name(&self) -> &str;

    /// Largest batch accepted by [`Destination::commit_batch`].
    fn max_batch_size(&self) -> usize;

    /// Apply one batch of writes.
    ///
    /// `Set` is a last-writer-wins upsert and `Delete` of an absent key is a
    /// no-op, so replaying a batch is safe.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) when the batch could
    /// not be applied. Transactional backends leave nothing applied; the
    /// file tree may have applied a prefix of the batch.
    fn commit_batch(&self, ops: &[WriteOperation]) -> error::Result<()>;
}

/// Read side used to load existing bucket state.
pub trait BucketReader: Send + Sync {
    /// Every document whose key equals `prefix` or lies beneath it, ordered
    /// by key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn read_prefix(&self, prefix: &DestinationKey) -> error::Result<Vec<StoredDocument>>;
}

/// Run history and failed-item log.
pub trait RunLedger: Send + Sync {
    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &str, mode: SyncMode) -> error::Result<i64>;

    /// Finalize a run with its sealed statistics.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, stats: &RunStats) -> error::Result<()>;

    /// Persist work items that failed extraction. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn record_failed_items(
        &self,
        pipeline: &str,
        run_id: i64,
        items: &[FailedItem],
    ) -> error::Result<u64>;
}
