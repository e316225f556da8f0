//! Pipeline YAML configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncforge_state::DEFAULT_MAX_BATCH_SIZE;
use syncforge_types::state::SyncMode;

use crate::backoff::BackoffPolicy;
use crate::orchestrator::{DateRange, RunParams};
use crate::shape::FieldShape;

/// Top-level pipeline configuration parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub state: StateConfig,
}

/// REST collection to read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// First segment of every destination key.
    pub resource: String,
    pub base_url: String,
    /// Path below `base_url`; `{item}` is replaced by the work item id.
    pub endpoint: String,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Field of the response body holding the record array.
    #[serde(default = "default_records_field")]
    pub records_field: String,
    #[serde(default)]
    pub id_fields: Vec<String>,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    #[serde(default)]
    pub years: Vec<u16>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Extra query parameters sent with every request.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

fn default_page_size() -> u32 {
    100
}

fn default_records_field() -> String {
    "dados".to_string()
}

/// Run-level tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_inter_chunk_pause_ms")]
    pub inter_chunk_pause_ms: u64,
    /// Total attempts per page, first call included.
    #[serde(default = "default_max_attempts", alias = "max_retries")]
    pub max_attempts: u32,
    #[serde(default = "default_max_pages_per_fetch")]
    pub max_pages_per_fetch: u32,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_concurrency() -> usize {
    5
}

fn default_inter_chunk_pause_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_pages_per_fetch() -> u32 {
    50
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            concurrency: default_concurrency(),
            inter_chunk_pause_ms: default_inter_chunk_pause_ms(),
            max_attempts: default_max_attempts(),
            max_pages_per_fetch: default_max_pages_per_fetch(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

/// Retry backoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    4_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(cfg: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_ms),
            max: Duration::from_millis(cfg.max_ms),
            multiplier: cfg.multiplier,
            jitter: cfg.jitter,
        }
    }
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// One JSON file per document under `path`.
    Files,
    /// `SQLite` database at `path`.
    Sqlite,
    /// Process memory; nothing survives the run.
    Memory,
}

impl DestinationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }

    #[must_use]
    pub fn needs_path(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// One write target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub name: String,
    pub kind: DestinationKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

/// Existing-state and run-history settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Destination existing buckets are read from. Required in incremental
    /// mode.
    #[serde(default)]
    pub read_from: Option<String>,
    /// `SQLite` file for the run ledger and failed-item log.
    #[serde(default)]
    pub history: Option<PathBuf>,
}

impl PipelineConfig {
    /// Engine run parameters.
    #[must_use]
    pub fn run_params(&self) -> RunParams {
        RunParams {
            mode: self.run.mode,
            concurrency: self.run.concurrency,
            inter_chunk_pause: Duration::from_millis(self.run.inter_chunk_pause_ms),
            max_attempts: self.run.max_attempts,
            max_pages_per_fetch: self.run.max_pages_per_fetch,
            operation_timeout: Duration::from_millis(self.run.operation_timeout_ms),
            backoff: BackoffPolicy::from(&self.backoff),
            years: self.source.years.clone(),
            date_range: self.source.date_range,
        }
    }

    #[must_use]
    pub fn shape(&self) -> FieldShape {
        FieldShape::new(
            self.source.id_fields.iter().cloned(),
            self.source.timestamp_field.as_deref(),
        )
    }
}
