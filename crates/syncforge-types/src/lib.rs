//! Shared syncforge data model.
//!
//! Records, bucket keys, pages, write operations, fetch errors and run
//! statistics. Used by the engine, the state backends and host adapters.

pub mod error;
pub mod page;
pub mod record;
pub mod state;
pub mod write;
