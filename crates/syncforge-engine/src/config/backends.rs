//! Storage backend construction from pipeline configuration.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use syncforge_state::{BucketReader, Destination, FileTreeStore, MemoryStore, RunLedger, SqliteStore};

use crate::config::types::{DestinationConfig, DestinationKind, PipelineConfig, StateConfig};

/// One opened store, seen through both of its storage traits.
#[derive(Clone)]
pub struct OpenedDestination {
    pub destination: Arc<dyn Destination>,
    pub reader: Arc<dyn BucketReader>,
}

impl OpenedDestination {
    fn share<S>(store: S) -> Self
    where
        S: Destination + BucketReader + 'static,
    {
        let store = Arc::new(store);
        Self {
            destination: Arc::clone(&store) as Arc<dyn Destination>,
            reader: store,
        }
    }
}

/// Write targets plus the reader for existing bucket state.
pub struct Backends {
    pub destinations: Vec<Arc<dyn Destination>>,
    pub reader: Option<Arc<dyn BucketReader>>,
    pub ledger: Option<Arc<dyn RunLedger>>,
}

fn required_path<'a>(cfg: &'a DestinationConfig) -> Result<&'a Path> {
    cfg.path.as_deref().with_context(|| {
        format!(
            "Destination '{}' of kind '{}' requires a path",
            cfg.name,
            cfg.kind.as_str()
        )
    })
}

/// Open the store a destination entry describes.
///
/// # Errors
///
/// Returns an error if a required path is missing or the store cannot be
/// opened.
pub fn open_destination(cfg: &DestinationConfig) -> Result<OpenedDestination> {
    let opened = match cfg.kind {
        DestinationKind::Files => {
            let store = FileTreeStore::new(required_path(cfg)?)
                .named(&cfg.name)
                .with_max_batch_size(cfg.max_batch_size);
            store
                .ensure_root()
                .with_context(|| format!("Failed to create directory for destination '{}'", cfg.name))?;
            OpenedDestination::share(store)
        }
        DestinationKind::Sqlite => {
            let path = required_path(cfg)?;
            let store = SqliteStore::open(path)
                .with_context(|| format!("Failed to open SQLite destination '{}'", cfg.name))?
                .named(&cfg.name)
                .with_max_batch_size(cfg.max_batch_size);
            OpenedDestination::share(store)
        }
        DestinationKind::Memory => OpenedDestination::share(
            MemoryStore::new()
                .named(&cfg.name)
                .with_max_batch_size(cfg.max_batch_size),
        ),
    };
    tracing::debug!(destination = cfg.name.as_str(), kind = cfg.kind.as_str(), "Destination opened");
    Ok(opened)
}

/// Open a destination only to read its existing buckets, creating nothing.
///
/// A `sqlite` file that does not exist yet reads as empty, like a `files`
/// root that does not exist.
///
/// # Errors
///
/// Returns an error if a required path is missing or an existing database
/// cannot be opened.
pub fn open_reader(cfg: &DestinationConfig) -> Result<Arc<dyn BucketReader>> {
    let reader: Arc<dyn BucketReader> = match cfg.kind {
        DestinationKind::Files => Arc::new(FileTreeStore::new(required_path(cfg)?).named(&cfg.name)),
        DestinationKind::Sqlite => {
            let path = required_path(cfg)?;
            if path.exists() {
                let store = SqliteStore::open_read_only(path)
                    .with_context(|| format!("Failed to open SQLite destination '{}' for reading", cfg.name))?
                    .named(&cfg.name);
                Arc::new(store)
            } else {
                tracing::debug!(
                    destination = cfg.name.as_str(),
                    path = %path.display(),
                    "State source does not exist yet"
                );
                Arc::new(MemoryStore::new().named(&cfg.name))
            }
        }
        DestinationKind::Memory => Arc::new(MemoryStore::new().named(&cfg.name)),
    };
    Ok(reader)
}

/// Open the run ledger, if one is configured.
///
/// # Errors
///
/// Returns an error if the ledger database cannot be opened.
pub fn open_ledger(state: &StateConfig) -> Result<Option<Arc<dyn RunLedger>>> {
    let Some(path) = &state.history else {
        return Ok(None);
    };
    let ledger = SqliteStore::open(path)
        .with_context(|| format!("Failed to open run history at {}", path.display()))?;
    Ok(Some(Arc::new(ledger) as Arc<dyn RunLedger>))
}

/// Open every backend a pipeline needs.
///
/// With `dry_run` each destination is replaced by an in-memory store with
/// the same name and batch size, so nothing is written. Existing state is
/// still read from the configured `read_from` destination through
/// [`open_reader`], and no ledger is opened.
///
/// # Errors
///
/// Returns an error if any store cannot be opened.
pub fn open_backends(config: &PipelineConfig, dry_run: bool) -> Result<Backends> {
    let mut destinations = Vec::with_capacity(config.destinations.len());
    let mut reader = None;

    for cfg in &config.destinations {
        let is_state_source = config.state.read_from.as_deref() == Some(cfg.name.as_str());
        if dry_run {
            let scratch = DestinationConfig {
                kind: DestinationKind::Memory,
                path: None,
                ..cfg.clone()
            };
            destinations.push(open_destination(&scratch)?.destination);
            if is_state_source {
                reader = Some(open_reader(cfg)?);
            }
        } else {
            let opened = open_destination(cfg)?;
            if is_state_source {
                reader = Some(Arc::clone(&opened.reader));
            }
            destinations.push(opened.destination);
        }
    }

    let ledger = if dry_run { None } else { open_ledger(&config.state)? };

    Ok(Backends {
        destinations,
        reader,
        ledger,
    })
}

/// Result of trying to open one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCheck {
    pub label: String,
    pub error: Option<String>,
}

impl BackendCheck {
    fn from_result<T>(label: String, result: Result<T>) -> Self {
        match result {
            Ok(_) => {
                tracing::info!(backend = label.as_str(), "Backend: OK");
                Self { label, error: None }
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::error!(backend = label.as_str(), error = error.as_str(), "Backend: FAILED");
                Self {
                    label,
                    error: Some(error),
                }
            }
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Try to open every configured destination and the run history, in
/// configuration order.
#[must_use]
pub fn check_backends(config: &PipelineConfig) -> Vec<BackendCheck> {
    let mut checks: Vec<BackendCheck> = config
        .destinations
        .iter()
        .map(|cfg| {
            BackendCheck::from_result(
                format!("{} [{}]", cfg.name, cfg.kind.as_str()),
                open_destination(cfg),
            )
        })
        .collect();
    if config.state.history.is_some() {
        checks.push(BackendCheck::from_result(
            "run history".to_string(),
            open_ledger(&config.state),
        ));
    }
    checks
}
