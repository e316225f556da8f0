//! Run-level model types: sync mode, pipeline stages, counters, and the
//! sealed [`RunStats`] returned from every pipeline run.
//!
//! Kept in the types crate so the engine and the state backends can share
//! them without circular dependencies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sync mode
// ---------------------------------------------------------------------------

/// Reconciliation policy applied to buckets observed in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Observed buckets are replaced by exactly the newly fetched records.
    #[default]
    Full,
    /// Observed buckets are merged with stored records, deduplicated by id.
    Incremental,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Initiated,
    Validating,
    Extracting,
    Transforming,
    Loading,
    Finalized,
    Errored,
}

impl PipelineStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Validating => "validating",
            Self::Extracting => "extracting",
            Self::Transforming => "transforming",
            Self::Loading => "loading",
            Self::Finalized => "finalized",
            Self::Errored => "errored",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Errored)
    }

    /// Legal transitions: the linear happy path, plus `Errored` from any
    /// non-terminal stage.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (from, Self::Errored) => !from.is_terminal(),
            (Self::Initiated, Self::Validating)
            | (Self::Validating, Self::Extracting)
            | (Self::Extracting, Self::Transforming)
            | (Self::Transforming, Self::Loading)
            | (Self::Loading, Self::Finalized) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Success/failure tally for one stage. `total == success + failure` always.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

impl StageCounts {
    pub fn record_success(&mut self, n: u64) {
        self.success += n;
        self.total += n;
    }

    pub fn record_failure(&mut self, n: u64) {
        self.failure += n;
        self.total += n;
    }

    pub fn absorb(&mut self, other: StageCounts) {
        self.record_success(other.success);
        self.record_failure(other.failure);
    }

    /// Fraction of successes, or `None` when nothing was attempted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.success as f64 / self.total as f64)
    }
}

/// Outcome of committing every staged write for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCommitResult {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u32,
    pub failed_batches: u32,
    pub elapsed_ms: u64,
}

/// Coarse classification of a [`BatchCommitResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// Nothing was staged for the destination.
    Empty,
    FullySucceeded,
    PartiallyFailed,
    FullyFailed,
}

impl BatchCommitResult {
    #[must_use]
    pub fn outcome(&self) -> CommitOutcome {
        match (self.attempted, self.failed) {
            (0, _) => CommitOutcome::Empty,
            (_, 0) => CommitOutcome::FullySucceeded,
            (a, f) if a == f => CommitOutcome::FullyFailed,
            _ => CommitOutcome::PartiallyFailed,
        }
    }

    #[must_use]
    pub fn as_counts(&self) -> StageCounts {
        StageCounts {
            total: self.attempted,
            success: self.succeeded,
            failure: self.failed,
        }
    }
}

/// Wall-clock span of one orchestrator stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sealed statistics for one pipeline run.
///
/// Produced once by the orchestrator when the run reaches a terminal stage;
/// returned by value for both completed and errored runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub pipeline: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    /// `Finalized` or `Errored`.
    pub final_stage: PipelineStage,
    /// Work items dispatched.
    pub extraction: StageCounts,
    /// Raw records normalized into bucketed records.
    pub transformation: StageCounts,
    /// Write operations committed, summed over destinations.
    pub load: StageCounts,
    pub warnings: u64,
    #[serde(default)]
    pub destinations: BTreeMap<String, BatchCommitResult>,
    #[serde(default)]
    pub stages: Vec<StageTiming>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunStats {
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.ended_at - self.started_at).num_milliseconds()).unwrap_or(0)
    }

    #[must_use]
    pub fn stage_timing(&self, stage: PipelineStage) -> Option<&StageTiming> {
        self.stages.iter().find(|t| t.stage == stage)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// A work item that failed extraction, kept for the failed-item log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item_id: String,
    pub error_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error_message: String,
    /// ISO-8601 UTC timestamp.
    pub failed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_counts_keep_total_consistent() {
        let mut counts = StageCounts::default();
        counts.record_success(7);
        counts.record_failure(3);
        assert_eq!(counts.total, 10);
        assert_eq!(counts.success + counts.failure, counts.total);
        assert_eq!(counts.success_rate(), Some(0.7));
        assert_eq!(StageCounts::default().success_rate(), None);
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use PipelineStage::*;
        let path = [Initiated, Validating, Extracting, Transforming, Loading, Finalized];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn errored_is_absorbing() {
        use PipelineStage::*;
        for stage in [Initiated, Validating, Extracting, Transforming, Loading] {
            assert!(stage.can_transition_to(Errored));
        }
        assert!(!Errored.can_transition_to(Validating));
        assert!(!Errored.can_transition_to(Errored));
        assert!(!Finalized.can_transition_to(Errored));
        assert!(!Initiated.can_transition_to(Loading));
    }

    #[test]
    fn commit_outcome_classification() {
        let mut result = BatchCommitResult::default();
        assert_eq!(result.outcome(), CommitOutcome::Empty);
        result.attempted = 10;
        result.succeeded = 10;
        assert_eq!(result.outcome(), CommitOutcome::FullySucceeded);
        result.succeeded = 4;
        result.failed = 6;
        assert_eq!(result.outcome(), CommitOutcome::PartiallyFailed);
        result.succeeded = 0;
        result.failed = 10;
        assert_eq!(result.outcome(), CommitOutcome::FullyFailed);
    }

    #[test]
    fn run_status_serde_roundtrip() {
        let json = serde_json::to_string(&RunStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let back: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RunStatus::Completed);
    }

    #[test]
    fn sync_mode_parses_snake_case() {
        let mode: SyncMode = serde_json::from_str("\"incremental\"").unwrap();
        assert_eq!(mode, SyncMode::Incremental);
        assert_eq!(SyncMode::default(), SyncMode::Full);
    }
}
