//! Batch persistence manager.
//!
//! Staged write operations accumulate per destination. On commit each
//! destination flushes its operations in batches no larger than its
//! `max_batch_size`, in staging order. A failing batch is counted and logged
//! and the next batch proceeds; destinations flush concurrently and never
//! affect each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use syncforge_state::Destination;
use syncforge_types::state::{BatchCommitResult, CommitOutcome, StageCounts};
use syncforge_types::write::WriteOperation;

/// Staging targeted a destination that is not registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown destination '{0}'")]
pub struct UnknownDestination(pub String);

/// Per-destination results of one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub destinations: BTreeMap<String, BatchCommitResult>,
}

impl CommitReport {
    /// Sum over every destination.
    #[must_use]
    pub fn totals(&self) -> StageCounts {
        let mut counts = StageCounts::default();
        for result in self.destinations.values() {
            counts.absorb(result.as_counts());
        }
        counts
    }

    #[must_use]
    pub fn outcome(&self, destination: &str) -> Option<CommitOutcome> {
        self.destinations.get(destination).map(BatchCommitResult::outcome)
    }

    /// Whether any batch failed anywhere.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.destinations.values().any(|r| r.failed > 0)
    }
}

struct Lane {
    destination: Arc<dyn Destination>,
    staged: Vec<WriteOperation>,
}

/// Accumulates writes and flushes them in bounded batches.
pub struct BatchPersistenceManager {
    lanes: Vec<Lane>,
}

impl BatchPersistenceManager {
    #[must_use]
    pub fn new(destinations: impl IntoIterator<Item = Arc<dyn Destination>>) -> Self {
        Self {
            lanes: destinations
                .into_iter()
                .map(|destination| Lane {
                    destination,
                    staged: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn destination_names(&self) -> impl Iterator<Item = &str> {
        self.lanes.iter().map(|lane| lane.destination.name())
    }

    /// Stage `op` for every registered destination.
    pub fn stage(&mut self, op: WriteOperation) {
        if let Some((last, rest)) = self.lanes.split_last_mut() {
            for lane in rest {
                lane.staged.push(op.clone());
            }
            last.staged.push(op);
        }
    }

    /// Stage `op` for one destination.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownDestination`] if no destination has that name.
    pub fn stage_to(&mut self, destination: &str, op: WriteOperation) -> Result<(), UnknownDestination> {
        let lane = self
            .lanes
            .iter_mut()
            .find(|lane| lane.destination.name() == destination)
            .ok_or_else(|| UnknownDestination(destination.to_string()))?;
        lane.staged.push(op);
        Ok(())
    }

    /// Operations staged for `destination` and not yet committed.
    #[must_use]
    pub fn pending(&self, destination: &str) -> usize {
        self.lanes
            .iter()
            .find(|lane| lane.destination.name() == destination)
            .map_or(0, |lane| lane.staged.len())
    }

    /// Flush everything staged. Staging buffers are emptied whatever the
    /// outcome; every registered destination appears in the report.
    pub async fn commit(&mut self) -> CommitReport {
        let flushes = self.lanes.iter_mut().map(|lane| {
            let ops = std::mem::take(&mut lane.staged);
            flush_destination(Arc::clone(&lane.destination), ops)
        });
        let results = join_all(flushes).await;
        CommitReport {
            destinations: results.into_iter().collect(),
        }
    }
}

async fn flush_destination(
    destination: Arc<dyn Destination>,
    ops: Vec<WriteOperation>,
) -> (String, BatchCommitResult) {
    let name = destination.name().to_string();
    let start = Instant::now();
    let max_batch_size = destination.max_batch_size().max(1);
    let mut result = BatchCommitResult::default();

    let mut remaining = ops;
    let mut batch_no = 0u32;
    while !remaining.is_empty() {
        let rest = remaining.split_off(remaining.len().min(max_batch_size));
        let batch = std::mem::replace(&mut remaining, rest);
        let size = batch.len() as u64;
        batch_no += 1;
        result.attempted += size;
        result.batches += 1;

        let dest = Arc::clone(&destination);
        let outcome = tokio::task::spawn_blocking(move || dest.commit_batch(&batch)).await;
        match outcome {
            Ok(Ok(())) => {
                result.succeeded += size;
                tracing::debug!(destination = name.as_str(), batch = batch_no, size, "Batch committed");
            }
            Ok(Err(e)) => {
                result.failed += size;
                result.failed_batches += 1;
                tracing::error!(
                    destination = name.as_str(),
                    batch = batch_no,
                    size,
                    error = %e,
                    "Batch commit failed"
                );
            }
            Err(join_err) => {
                result.failed += size;
                result.failed_batches += 1;
                tracing::error!(
                    destination = name.as_str(),
                    batch = batch_no,
                    size,
                    error = %join_err,
                    "Batch commit task panicked"
                );
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    {
        result.elapsed_ms = start.elapsed().as_millis() as u64;
    }
    if result.attempted > 0 {
        tracing::info!(
            destination = name.as_str(),
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            batches = result.batches,
            elapsed_ms = result.elapsed_ms,
            "Destination flushed"
        );
    }
    (name, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncforge_state::MemoryStore;
    use syncforge_types::write::DestinationKey;

    fn ops(n: usize) -> Vec<WriteOperation> {
        (0..n)
            .map(|i| WriteOperation::set(DestinationKey::new(format!("k/{i:05}")), json!(i)))
            .collect()
    }

    #[tokio::test]
    async fn splits_into_bounded_batches_and_isolates_failures() {
        let store = Arc::new(MemoryStore::new().named("m").fail_on_batches([2]));
        let mut manager = BatchPersistenceManager::new([store.clone() as Arc<dyn Destination>]);
        for op in ops(1_200) {
            manager.stage(op);
        }

        let report = manager.commit().await;
        let result = report.destinations["m"];
        assert_eq!(result.attempted, 1_200);
        assert_eq!(result.succeeded, 1_000);
        assert_eq!(result.failed, 200);
        assert_eq!(result.batches, 3);
        assert_eq!(result.failed_batches, 1);
        assert_eq!(report.outcome("m"), Some(CommitOutcome::PartiallyFailed));
        assert_eq!(store.batches_seen(), 3);
        assert_eq!(store.len().unwrap(), 700);
    }

    #[tokio::test]
    async fn destinations_are_independent() {
        let good = Arc::new(MemoryStore::new().named("good").with_max_batch_size(10));
        let bad = Arc::new(MemoryStore::new().named("bad").fail_on_batches(1..=100));
        let mut manager = BatchPersistenceManager::new([
            good.clone() as Arc<dyn Destination>,
            bad.clone() as Arc<dyn Destination>,
        ]);
        for op in ops(25) {
            manager.stage(op);
        }

        let report = manager.commit().await;
        assert_eq!(report.outcome("good"), Some(CommitOutcome::FullySucceeded));
        assert_eq!(report.outcome("bad"), Some(CommitOutcome::FullyFailed));
        assert_eq!(report.destinations["good"].batches, 3);
        assert_eq!(good.len().unwrap(), 25);
        assert!(report.has_failures());
        let totals = report.totals();
        assert_eq!((totals.total, totals.success, totals.failure), (50, 25, 25));
    }

    #[tokio::test]
    async fn stage_to_targets_one_destination() {
        let a = Arc::new(MemoryStore::new().named("a"));
        let b = Arc::new(MemoryStore::new().named("b"));
        let mut manager =
            BatchPersistenceManager::new([a.clone() as Arc<dyn Destination>, b.clone() as Arc<dyn Destination>]);
        manager.stage_to("b", ops(1).remove(0)).unwrap();
        assert_eq!(manager.pending("a"), 0);
        assert_eq!(manager.pending("b"), 1);
        assert_eq!(
            manager.stage_to("c", ops(1).remove(0)),
            Err(UnknownDestination("c".into()))
        );

        let report = manager.commit().await;
        assert_eq!(report.outcome("a"), Some(CommitOutcome::Empty));
        assert_eq!(report.outcome("b"), Some(CommitOutcome::FullySucceeded));
        assert!(a.is_empty().unwrap());
        assert_eq!(manager.pending("b"), 0);
    }

    #[tokio::test]
    async fn later_staging_wins_within_destination() {
        let store = Arc::new(MemoryStore::new().named("m").with_max_batch_size(1));
        let mut manager = BatchPersistenceManager::new([store.clone() as Arc<dyn Destination>]);
        let key = DestinationKey::new("k/1");
        manager.stage(WriteOperation::set(key.clone(), json!("first")));
        manager.stage(WriteOperation::set(key.clone(), json!("second")));
        manager.commit().await;
        assert_eq!(store.get(&key).unwrap(), Some(json!("second")));
    }
}
