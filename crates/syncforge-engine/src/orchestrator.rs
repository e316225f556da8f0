//! Pipeline orchestrator.
//!
//! Drives one run through `Initiated -> Validating -> Extracting ->
//! Transforming -> Loading -> Finalized`, falling to `Errored` on a
//! validation or stage-level failure. Item-level and batch-level failures are
//! counted and the run continues. Statistics are sealed once, at the
//! terminal stage, and returned in both outcomes.

use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use syncforge_state::{BucketReader, Destination, RunLedger};
use syncforge_types::record::BucketKey;
use syncforge_types::state::{
    BatchCommitResult, FailedItem, PipelineStage, RunStats, RunStatus, StageCounts, StageTiming,
    SyncMode,
};
use syncforge_types::write::{DestinationKey, StoredDocument};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::BackoffPolicy;
use crate::dispatch::{DispatchObserver, DispatchProgress, Dispatcher, FetchResult, WorkItem};
use crate::document::{decode_entity, entity_prefix, BucketDocument};
use crate::errors::{PipelineError, PipelineFailure, ValidationError};
use crate::failed::{collect_failed_items, persist_failed_items};
use crate::pagination::fetch_item;
use crate::persist::BatchPersistenceManager;
use crate::reconcile::{reconcile, BucketState};
use crate::retry::RetryExecutor;
use crate::shape::RecordShape;
use crate::source::PageSource;
use crate::transform::{transform, EntityBuckets};

pub const MAX_CONCURRENCY: usize = 64;
pub const MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Run parameters
// ---------------------------------------------------------------------------

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Parameters checked during `Validating`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub mode: SyncMode,
    pub concurrency: usize,
    pub inter_chunk_pause: Duration,
    /// Total attempts per page, first call included.
    pub max_attempts: u32,
    pub max_pages_per_fetch: u32,
    pub operation_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Query window by year. Exclusive with `date_range`.
    pub years: Vec<u16>,
    pub date_range: Option<DateRange>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            mode: SyncMode::Full,
            concurrency: 5,
            inter_chunk_pause: Duration::from_millis(1_000),
            max_attempts: 3,
            max_pages_per_fetch: 50,
            operation_timeout: crate::retry::DEFAULT_OPERATION_TIMEOUT,
            backoff: BackoffPolicy::default(),
            years: Vec::new(),
            date_range: None,
        }
    }
}

impl RunParams {
    /// Every constraint violation, in a stable order.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            problems.push(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.concurrency
            ));
        }
        if !(1..=MAX_ATTEMPTS).contains(&self.max_attempts) {
            problems.push(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS}, got {}",
                self.max_attempts
            ));
        }
        if self.max_pages_per_fetch == 0 {
            problems.push("max_pages_per_fetch must be at least 1".to_string());
        }
        if self.operation_timeout.is_zero() {
            problems.push("operation_timeout_ms must be > 0".to_string());
        }

        let b = &self.backoff;
        if b.base.is_zero() {
            problems.push("backoff base_ms must be > 0".to_string());
        }
        if b.max < b.base {
            problems.push("backoff max_ms must be >= base_ms".to_string());
        }
        if !(b.multiplier >= 1.0 && b.multiplier.is_finite()) {
            problems.push(format!("backoff multiplier must be >= 1, got {}", b.multiplier));
        }
        if !(0.0..=1.0).contains(&b.jitter) {
            problems.push(format!("backoff jitter must be within [0, 1], got {}", b.jitter));
        }

        if !self.years.is_empty() && self.date_range.is_some() {
            problems.push("years and date_range are mutually exclusive".to_string());
        }
        for year in &self.years {
            if !(1000..=9999).contains(year) {
                problems.push(format!("year {year} is not a 4-digit year"));
            }
        }
        if let Some(range) = self.date_range {
            if range.start > range.end {
                problems.push(format!(
                    "date_range start {} is after end {}",
                    range.start, range.end
                ));
            }
        }

        problems
    }

    /// # Errors
    ///
    /// Returns [`ValidationError`] listing every violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check(self.problems())
    }

    fn executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.backoff, self.max_attempts).with_operation_timeout(self.operation_timeout)
    }
}

// ---------------------------------------------------------------------------
// Stage tracking
// ---------------------------------------------------------------------------

/// Mutable run state, owned by the orchestrating task.
struct RunTracker {
    stage: PipelineStage,
    stage_started: DateTime<Utc>,
    stages: Vec<StageTiming>,
    started_at: DateTime<Utc>,
    extraction: StageCounts,
    transformation: StageCounts,
    load: StageCounts,
    warnings: u64,
    destinations: BTreeMap<String, BatchCommitResult>,
    failed_items: Vec<FailedItem>,
}

impl RunTracker {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            stage: PipelineStage::Initiated,
            stage_started: now,
            stages: Vec::new(),
            started_at: now,
            extraction: StageCounts::default(),
            transformation: StageCounts::default(),
            load: StageCounts::default(),
            warnings: 0,
            destinations: BTreeMap::new(),
            failed_items: Vec::new(),
        }
    }

    fn advance(&mut self, next: PipelineStage) -> Result<(), PipelineError> {
        if !self.stage.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.close_stage();
        self.stage = next;
        tracing::debug!(stage = %next, "Entering stage");
        Ok(())
    }

    /// Record the timing of the stage being left.
    fn close_stage(&mut self) {
        let now = Utc::now();
        if self.stage != PipelineStage::Initiated && !self.stage.is_terminal() {
            self.stages.push(StageTiming {
                stage: self.stage,
                started_at: self.stage_started,
                ended_at: now,
                duration_ms: u64::try_from((now - self.stage_started).num_milliseconds()).unwrap_or(0),
            });
        }
        self.stage_started = now;
    }

    fn fail(&mut self) {
        if self.stage.is_terminal() {
            return;
        }
        self.close_stage();
        self.stage = PipelineStage::Errored;
    }

    fn seal(self, pipeline: &str, mode: SyncMode, error: Option<&PipelineError>) -> RunStats {
        RunStats {
            pipeline: pipeline.to_string(),
            mode,
            status: if error.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            final_stage: self.stage,
            extraction: self.extraction,
            transformation: self.transformation,
            load: self.load,
            warnings: self.warnings,
            destinations: self.destinations,
            stages: self.stages,
            started_at: self.started_at,
            ended_at: Utc::now(),
            error_message: error.map(ToString::to_string),
        }
    }
}

/// Logs dispatch progress and stops dispatch once the run is cancelled.
struct ExtractionProgress<'a> {
    cancel: &'a CancellationToken,
}

impl DispatchObserver for ExtractionProgress<'_> {
    fn on_chunk(&mut self, progress: &DispatchProgress) -> ControlFlow<()> {
        tracing::info!(
            chunk = progress.chunk,
            chunks = progress.chunks,
            completed = progress.completed,
            total = progress.total,
            succeeded = progress.succeeded,
            "Extraction progress"
        );
        if self.cancel.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// One configured pipeline. Capabilities are injected; nothing is global.
pub struct Orchestrator {
    pipeline: String,
    params: RunParams,
    source: Arc<dyn PageSource>,
    shape: Arc<dyn RecordShape>,
    destinations: Vec<Arc<dyn Destination>>,
    reader: Option<Arc<dyn BucketReader>>,
    ledger: Option<Arc<dyn RunLedger>>,
    span: tracing::Span,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        pipeline: impl Into<String>,
        params: RunParams,
        source: Arc<dyn PageSource>,
        shape: Arc<dyn RecordShape>,
    ) -> Self {
        let pipeline = pipeline.into();
        let span = tracing::info_span!("pipeline", name = pipeline.as_str());
        Self {
            pipeline,
            params,
            source,
            shape,
            destinations: Vec::new(),
            reader: None,
            ledger: None,
            span,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Where existing bucket state is read from in incremental mode.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn BucketReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Span every event of the run is recorded under.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Token that stops dispatch between chunks when cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn params(&self) -> &RunParams {
        &self.params
    }

    /// Run the pipeline over `items`.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineFailure`] carrying the statistics captured so far
    /// when validation fails or a stage hits an unrecoverable error.
    /// Individual item and batch failures do not fail the run.
    pub async fn run(&self, items: &[String]) -> Result<RunStats, PipelineFailure> {
        self.run_inner(items).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, items: &[String]) -> Result<RunStats, PipelineFailure> {
        let mode = self.params.mode;
        tracing::info!(
            pipeline = self.pipeline.as_str(),
            mode = %mode,
            items = items.len(),
            destinations = self.destinations.len(),
            "Starting pipeline run"
        );

        let mut tracker = RunTracker::new();
        let mut run_id = None;
        let outcome = match self.begin(items, &mut tracker) {
            Ok(()) => {
                run_id = self.start_ledger_run().await;
                match self.execute(items, &mut tracker).await {
                    Ok(()) => tracker.advance(PipelineStage::Finalized),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let error = outcome.err();
        if error.is_some() {
            tracker.fail();
        }
        let failed_items = std::mem::take(&mut tracker.failed_items);
        let stats = tracker.seal(&self.pipeline, mode, error.as_ref());
        self.finish_ledger_run(run_id, &stats, failed_items).await;

        match error {
            None => {
                tracing::info!(
                    pipeline = self.pipeline.as_str(),
                    items_ok = stats.extraction.success,
                    items_failed = stats.extraction.failure,
                    records = stats.transformation.success,
                    writes_ok = stats.load.success,
                    writes_failed = stats.load.failure,
                    warnings = stats.warnings,
                    duration_ms = stats.duration_ms(),
                    "Pipeline run completed"
                );
                Ok(stats)
            }
            Some(error) => {
                tracing::error!(
                    pipeline = self.pipeline.as_str(),
                    stage = %stats.stages.last().map_or(PipelineStage::Initiated, |t| t.stage),
                    error = %error,
                    "Pipeline run errored"
                );
                Err(PipelineFailure { error, stats })
            }
        }
    }

    /// Validation; nothing is read or written before it passes.
    fn begin(&self, items: &[String], tracker: &mut RunTracker) -> Result<(), PipelineError> {
        tracker.advance(PipelineStage::Validating)?;
        self.validate(items)
    }

    async fn execute(&self, items: &[String], tracker: &mut RunTracker) -> Result<(), PipelineError> {
        tracker.advance(PipelineStage::Extracting)?;
        let results = self.extract(items).await;
        tracker.extraction = StageCounts::default();
        for result in &results {
            if result.is_success() {
                tracker.extraction.record_success(1);
            } else {
                tracker.extraction.record_failure(1);
            }
            if result.truncated {
                tracker.warnings += 1;
            }
        }
        tracker.failed_items = collect_failed_items(&results);

        tracker.advance(PipelineStage::Transforming)?;
        let transformed = transform(&results, self.shape.as_ref());
        drop(results);
        tracker.transformation = transformed.counts;
        tracker.warnings += transformed.warnings;

        tracker.advance(PipelineStage::Loading)?;
        self.load(transformed.entities, tracker).await
    }

    fn validate(&self, items: &[String]) -> Result<(), PipelineError> {
        let mut problems = self.params.problems();
        if self.destinations.is_empty() {
            problems.push("at least one destination is required".to_string());
        }
        let mut names = HashSet::new();
        for destination in &self.destinations {
            if !names.insert(destination.name()) {
                problems.push(format!("duplicate destination name '{}'", destination.name()));
            }
        }
        if self.params.mode == SyncMode::Incremental && self.reader.is_none() {
            problems.push("incremental mode requires a state reader".to_string());
        }
        let mut seen = HashSet::new();
        for item in items {
            if item.trim().is_empty() {
                problems.push("work item ids must not be empty".to_string());
            } else if item.contains('/') || item == "." || item == ".." {
                problems.push(format!("work item '{item}' is not a single key segment"));
            } else if !seen.insert(item.as_str()) {
                problems.push(format!("duplicate work item '{item}'"));
            }
        }
        ValidationError::check(problems).map_err(PipelineError::from)
    }

    async fn extract(&self, items: &[String]) -> Vec<FetchResult> {
        let executor = self.params.executor();
        let source = self.source.as_ref();
        let max_pages = self.params.max_pages_per_fetch;
        let work: Vec<WorkItem<'_>> = items
            .iter()
            .map(|item| {
                WorkItem::new(
                    item.clone(),
                    fetch_item(source, &executor, max_pages, item).boxed(),
                )
            })
            .collect();

        let dispatcher = Dispatcher::new(self.params.concurrency, self.params.inter_chunk_pause);
        let mut observer = ExtractionProgress {
            cancel: &self.cancel,
        };
        dispatcher.dispatch(work, &mut observer).await
    }

    async fn load(&self, entities: Vec<EntityBuckets>, tracker: &mut RunTracker) -> Result<(), PipelineError> {
        let resource = self.source.resource().to_string();
        let mode = self.params.mode;

        let mut existing = match mode {
            SyncMode::Full => BTreeMap::new(),
            SyncMode::Incremental => self.read_existing(&resource, &entities).await?,
        };

        let mut manager = BatchPersistenceManager::new(self.destinations.iter().cloned());
        let now = Utc::now();
        let mut staged = 0usize;
        for entity in entities {
            let (stored, skipped) = existing.remove(&entity.entity).unwrap_or_default();
            tracker.warnings += skipped;
            let outcome = reconcile(entity.buckets, stored, mode);
            tracing::debug!(
                entity = entity.entity.as_str(),
                touched = outcome.touched.len(),
                added = outcome.added,
                updated = outcome.updated,
                retained = outcome.retained,
                "Reconciled entity"
            );
            for bucket in outcome.touched_buckets() {
                let op = BucketDocument::write_operation(&resource, &entity.entity, bucket, now)
                    .map_err(|e| {
                        PipelineError::fatal(
                            PipelineStage::Loading,
                            format!("bucket {} of '{}' did not encode: {e}", bucket.key, entity.entity),
                        )
                    })?;
                manager.stage(op);
                staged += 1;
            }
        }

        tracing::info!(buckets = staged, "Committing bucket documents");
        let report = manager.commit().await;
        tracker.load = report.totals();
        tracker.destinations = report.destinations;
        Ok(())
    }

    /// Stored buckets of every entity, read before anything is staged.
    async fn read_existing(
        &self,
        resource: &str,
        entities: &[EntityBuckets],
    ) -> Result<BTreeMap<String, (BTreeMap<BucketKey, BucketState>, u64)>, PipelineError> {
        let Some(reader) = self.reader.clone() else {
            return Err(PipelineError::fatal(
                PipelineStage::Loading,
                "incremental load without a state reader",
            ));
        };
        let prefixes: Vec<(String, DestinationKey)> = entities
            .iter()
            .map(|e| (e.entity.clone(), entity_prefix(resource, &e.entity)))
            .collect();

        let read: Vec<(String, DestinationKey, Vec<StoredDocument>)> = tokio::task::spawn_blocking(move || {
            prefixes
                .into_iter()
                .map(|(entity, prefix)| reader.read_prefix(&prefix).map(|docs| (entity, prefix, docs)))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| PipelineError::fatal(PipelineStage::Loading, format!("state read task panicked: {e}")))?
        .map_err(|source| PipelineError::State {
            stage: PipelineStage::Loading,
            source,
        })?;

        let documents: usize = read.iter().map(|(_, _, docs)| docs.len()).sum();
        tracing::info!(entities = read.len(), documents, "Loaded existing bucket state");

        Ok(read
            .into_iter()
            .map(|(entity, prefix, docs)| {
                let decoded = decode_entity(&prefix, &docs);
                (entity, decoded)
            })
            .collect())
    }

    async fn start_ledger_run(&self) -> Option<i64> {
        let ledger = self.ledger.clone()?;
        let pipeline = self.pipeline.clone();
        let mode = self.params.mode;
        match tokio::task::spawn_blocking(move || ledger.start_run(&pipeline, mode)).await {
            Ok(Ok(run_id)) => Some(run_id),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to start run in ledger");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "start_run task panicked");
                None
            }
        }
    }

    async fn finish_ledger_run(&self, run_id: Option<i64>, stats: &RunStats, failed_items: Vec<FailedItem>) {
        let (Some(ledger), Some(run_id)) = (self.ledger.clone(), run_id) else {
            return;
        };
        let stats = stats.clone();
        let pipeline = self.pipeline.clone();
        let joined = tokio::task::spawn_blocking(move || {
            if let Err(e) = ledger.complete_run(run_id, &stats) {
                tracing::error!(run_id, error = %e, "Failed to complete run in ledger");
            }
            persist_failed_items(ledger.as_ref(), &pipeline, run_id, &failed_items);
        })
        .await;
        if let Err(e) = joined {
            tracing::error!(run_id, error = %e, "complete_run task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use syncforge_state::{MemoryStore, SqliteStore};
    use syncforge_types::error::FetchError;
    use syncforge_types::page::{Page, PageCursor};
    use syncforge_types::record::Record;
    use syncforge_types::write::WriteOperation;

    use crate::reconcile::bucketize;
    use crate::shape::FieldShape;

    /// One page per item; item "404" is missing.
    struct FixedSource;

    #[async_trait]
    impl PageSource for FixedSource {
        fn resource(&self) -> &str {
            "despesas"
        }

        async fn fetch_page(&self, item: &str, _cursor: Option<&PageCursor>) -> Result<Page, FetchError> {
            if item == "404" {
                return Err(FetchError::http(404, "no such deputy"));
            }
            Ok(Page::last(vec![
                json!({"id": format!("{item}-a"), "date": "2023-04-01"}),
                json!({"id": format!("{item}-b"), "date": "2024-02-01"}),
            ]))
        }
    }

    fn fast_params(mode: SyncMode) -> RunParams {
        RunParams {
            mode,
            inter_chunk_pause: Duration::ZERO,
            backoff: BackoffPolicy::default().without_jitter(),
            ..RunParams::default()
        }
    }

    fn orchestrator(mode: SyncMode) -> Orchestrator {
        Orchestrator::new(
            "expenses",
            fast_params(mode),
            Arc::new(FixedSource),
            Arc::new(FieldShape::new(["id"], Some("date"))),
        )
    }

    fn items(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn default_params_are_valid() {
        assert!(RunParams::default().validate().is_ok());
    }

    #[test]
    fn params_report_every_problem() {
        let params = RunParams {
            concurrency: 0,
            max_attempts: 6,
            max_pages_per_fetch: 0,
            operation_timeout: Duration::ZERO,
            years: vec![2023],
            date_range: Some(DateRange {
                start: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            }),
            ..RunParams::default()
        };
        let problems = params.problems();
        assert_eq!(problems.len(), 6, "{problems:?}");
    }

    #[test]
    fn tracker_rejects_illegal_transitions() {
        let mut tracker = RunTracker::new();
        let err = tracker.advance(PipelineStage::Loading).unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));
        tracker.advance(PipelineStage::Validating).unwrap();
        tracker.fail();
        assert_eq!(tracker.stage, PipelineStage::Errored);
        assert!(tracker.advance(PipelineStage::Extracting).is_err());
        assert_eq!(tracker.stages.len(), 1);
    }

    #[tokio::test]
    async fn completed_run_counts_every_stage() {
        let store = Arc::new(MemoryStore::new().named("mem"));
        let orchestrator = orchestrator(SyncMode::Full).with_destination(store.clone());

        let stats = orchestrator.run(&items(&["1", "404", "2"])).await.unwrap();
        assert_eq!(stats.status, RunStatus::Completed);
        assert_eq!(stats.final_stage, PipelineStage::Finalized);
        assert_eq!((stats.extraction.success, stats.extraction.failure), (2, 1));
        assert_eq!(stats.transformation.success, 4);
        assert_eq!((stats.load.total, stats.load.success), (4, 4));
        assert_eq!(store.len().unwrap(), 4);
        assert!(store
            .get(&DestinationKey::new("despesas/1/2023"))
            .unwrap()
            .is_some());
        assert!(store.read_prefix(&DestinationKey::new("despesas/404")).unwrap().is_empty());

        let stages: Vec<PipelineStage> = stats.stages.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            vec![
                PipelineStage::Validating,
                PipelineStage::Extracting,
                PipelineStage::Transforming,
                PipelineStage::Loading,
            ]
        );
    }

    #[tokio::test]
    async fn validation_failure_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let params = RunParams {
            concurrency: 0,
            ..fast_params(SyncMode::Full)
        };
        let orchestrator = Orchestrator::new(
            "bad",
            params,
            Arc::new(FixedSource),
            Arc::new(FieldShape::new(["id"], None)),
        )
        .with_destination(store.clone());

        let failure = orchestrator.run(&items(&["1"])).await.unwrap_err();
        assert!(failure.error.is_validation());
        assert_eq!(failure.stats.status, RunStatus::Failed);
        assert_eq!(failure.stats.final_stage, PipelineStage::Errored);
        assert_eq!(failure.stats.extraction.total, 0);
        assert!(store.is_empty().unwrap());
        assert_eq!(store.batches_seen(), 0);
    }

    #[tokio::test]
    async fn incremental_without_reader_is_invalid() {
        let orchestrator = orchestrator(SyncMode::Incremental).with_destination(Arc::new(MemoryStore::new()));
        let failure = orchestrator.run(&items(&["1"])).await.unwrap_err();
        assert!(failure.error.to_string().contains("state reader"));
    }

    #[tokio::test]
    async fn duplicate_items_are_invalid() {
        let orchestrator = orchestrator(SyncMode::Full).with_destination(Arc::new(MemoryStore::new()));
        let failure = orchestrator.run(&items(&["1", "1"])).await.unwrap_err();
        assert!(failure.error.to_string().contains("duplicate work item '1'"));
    }

    /// Ledger that remembers every call.
    #[derive(Default)]
    struct RecordingLedger {
        started: Mutex<Vec<(String, SyncMode)>>,
        completed: Mutex<Vec<(i64, RunStatus)>>,
        failed: Mutex<Vec<(i64, FailedItem)>>,
    }

    impl RunLedger for RecordingLedger {
        fn start_run(&self, pipeline: &str, mode: SyncMode) -> syncforge_state::error::Result<i64> {
            let mut started = self.started.lock().unwrap();
            started.push((pipeline.to_string(), mode));
            Ok(i64::try_from(started.len()).unwrap())
        }

        fn complete_run(&self, run_id: i64, stats: &RunStats) -> syncforge_state::error::Result<()> {
            self.completed.lock().unwrap().push((run_id, stats.status));
            Ok(())
        }

        fn record_failed_items(
            &self,
            _pipeline: &str,
            run_id: i64,
            items: &[FailedItem],
        ) -> syncforge_state::error::Result<u64> {
            let mut failed = self.failed.lock().unwrap();
            failed.extend(items.iter().cloned().map(|item| (run_id, item)));
            Ok(items.len() as u64)
        }
    }

    #[tokio::test]
    async fn ledger_records_run_and_failed_items() {
        let ledger = Arc::new(RecordingLedger::default());
        let orchestrator = orchestrator(SyncMode::Full)
            .with_destination(Arc::new(MemoryStore::new()))
            .with_ledger(ledger.clone());
        let stats = orchestrator.run(&items(&["1", "404"])).await.unwrap();
        assert!(stats.is_success());

        assert_eq!(
            *ledger.started.lock().unwrap(),
            vec![("expenses".to_string(), SyncMode::Full)]
        );
        assert_eq!(*ledger.completed.lock().unwrap(), vec![(1, RunStatus::Completed)]);
        let failed = ledger.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        let (run_id, item) = &failed[0];
        assert_eq!(*run_id, 1);
        assert_eq!(item.item_id, "404");
        assert_eq!(item.status, Some(404));
        assert_eq!(item.error_kind, "http");
        assert!(item.error_message.contains("no such deputy"));
    }

    #[tokio::test]
    async fn validation_failure_leaves_ledger_untouched() {
        let recording = Arc::new(RecordingLedger::default());
        let sqlite = Arc::new(SqliteStore::in_memory().unwrap());
        let params = RunParams {
            concurrency: 0,
            ..fast_params(SyncMode::Full)
        };
        let ledgers: [Arc<dyn RunLedger>; 2] = [recording.clone(), sqlite.clone()];
        for ledger in ledgers {
            let orchestrator = Orchestrator::new(
                "bad",
                params.clone(),
                Arc::new(FixedSource),
                Arc::new(FieldShape::new(["id"], None)),
            )
            .with_destination(Arc::new(MemoryStore::new()))
            .with_ledger(ledger);
            let failure = orchestrator.run(&items(&["1"])).await.unwrap_err();
            assert!(failure.error.is_validation());
        }

        assert!(recording.started.lock().unwrap().is_empty());
        assert!(recording.completed.lock().unwrap().is_empty());
        assert_eq!(sqlite.start_run("bad", SyncMode::Full).unwrap(), 1);
    }

    #[tokio::test]
    async fn path_like_items_are_invalid() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(SyncMode::Full).with_destination(store.clone());
        let failure = orchestrator
            .run(&items(&["10", "10/x", ".", ".."]))
            .await
            .unwrap_err();
        assert!(failure.error.is_validation());
        let message = failure.error.to_string();
        assert!(message.contains("'10/x' is not a single key segment"), "{message}");
        assert!(message.contains("'..' is not a single key segment"), "{message}");
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn incremental_reads_only_the_entity_own_buckets() {
        let store = Arc::new(MemoryStore::new());
        let nested = BucketDocument::write_operation(
            "despesas",
            "10",
            &bucketize([Record::new(
                "10/x-rec",
                BucketKey::Year(2023),
                json!({"id": "10/x-rec"}),
            )])
            .remove(&BucketKey::Year(2023))
            .unwrap(),
            Utc::now(),
        )
        .unwrap();
        store
            .commit_batch(&[WriteOperation::set(
                DestinationKey::new("despesas/10/x/2023"),
                nested.payload,
            )])
            .unwrap();

        let orchestrator = orchestrator(SyncMode::Incremental)
            .with_destination(store.clone())
            .with_reader(store.clone());
        orchestrator.run(&items(&["10"])).await.unwrap();

        let doc = store.get(&DestinationKey::new("despesas/10/2023")).unwrap().unwrap();
        let ids: Vec<&str> = doc["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["10-a"]);
    }

    #[tokio::test]
    async fn cancelled_token_skips_later_chunks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let params = RunParams {
            concurrency: 1,
            ..fast_params(SyncMode::Full)
        };
        let orchestrator = Orchestrator::new(
            "expenses",
            params,
            Arc::new(FixedSource),
            Arc::new(FieldShape::new(["id"], Some("date"))),
        )
        .with_destination(Arc::new(MemoryStore::new()))
        .with_cancellation(cancel);

        let stats = orchestrator.run(&items(&["1", "2", "3"])).await.unwrap();
        assert_eq!((stats.extraction.success, stats.extraction.failure), (1, 2));
        assert_eq!(stats.load.total, 2);
    }
}
