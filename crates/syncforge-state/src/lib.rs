//! Persistence backends for syncforge.
//!
//! Provides the [`Destination`](backend::Destination),
//! [`BucketReader`](backend::BucketReader) and [`RunLedger`](backend::RunLedger)
//! traits with a [`SqliteStore`](sqlite::SqliteStore), a file-tree store and
//! an in-memory store used by tests and dry runs.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod fs;
pub mod memory;
pub mod sqlite;

pub use backend::{BucketReader, Destination, RunLedger, DEFAULT_MAX_BATCH_SIZE};
pub use error::StateError;
pub use fs::FileTreeStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Common imports for backend consumers.
pub mod prelude {
    pub use crate::backend::{BucketReader, Destination, RunLedger, DEFAULT_MAX_BATCH_SIZE};
    pub use crate::error::StateError;
    pub use crate::fs::FileTreeStore;
    pub use crate::memory::MemoryStore;
    pub use crate::sqlite::SqliteStore;
    pub use syncforge_types::state::{FailedItem, RunStats, SyncMode};
    pub use syncforge_types::write::{DestinationKey, StoredDocument, WriteKind, WriteOperation};
}
