//! Extraction, reconciliation and persistence engine for syncforge pipelines.
//!
//! A run fetches every work item through a [`PageSource`](source::PageSource)
//! under bounded concurrency, normalises the raw records with a
//! [`RecordShape`](shape::RecordShape), reconciles them against stored
//! year buckets and commits the touched buckets to every configured
//! destination in bounded batches.

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod errors;
pub(crate) mod failed;
pub mod orchestrator;
pub mod pagination;
pub mod persist;
pub mod reconcile;
pub mod retry;
pub mod shape;
pub mod source;
pub mod transform;

// Re-export public API for convenience
pub use errors::{PipelineError, PipelineFailure, ValidationError};
pub use orchestrator::{Orchestrator, RunParams};
