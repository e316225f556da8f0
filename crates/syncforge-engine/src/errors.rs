//! Run-level error model.
//!
//! Item-level fetch failures and batch-level persistence failures are folded
//! into [`RunStats`] and never surface here. Only configuration problems and
//! stage-level invariant failures abort a run.

use syncforge_state::StateError;
use syncforge_types::state::{PipelineStage, RunStats};

/// Every problem found while validating run parameters, reported together.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed:\n  - {}", .problems.join("\n  - "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    /// `Ok(())` when `problems` is empty.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] carrying every problem otherwise.
    pub fn check(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

/// Error that moves a run to `Errored`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad run parameters; raised before any I/O.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Stage-level unrecoverable failure.
    #[error("{stage} stage failed: {message}")]
    Fatal {
        stage: PipelineStage,
        message: String,
    },

    /// A stage transition outside the state machine. Always a bug.
    #[error("illegal stage transition {from} -> {to}")]
    IllegalTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    /// Existing state could not be read.
    #[error("{stage} stage failed reading existing state: {source}")]
    State {
        stage: PipelineStage,
        #[source]
        source: StateError,
    },
}

impl PipelineError {
    pub(crate) fn fatal(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self::Fatal {
            stage,
            message: message.into(),
        }
    }

    /// Whether the run failed before touching any external system.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// A failed run: the error plus the statistics captured up to the failure.
#[derive(Debug, thiserror::Error)]
#[error("pipeline '{}' errored: {error}", .stats.pipeline)]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub stats: RunStats,
}
