//! `SQLite`-backed document store and run ledger.
//!
//! Uses a single `Mutex<Connection>` for thread safety. Every batch is one
//! transaction, so a failed batch leaves nothing behind.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use syncforge_types::state::{FailedItem, RunStats, RunStatus, SyncMode};
use syncforge_types::write::{DestinationKey, StoredDocument, WriteKind, WriteOperation};

use crate::backend::{BucketReader, Destination, RunLedger, DEFAULT_MAX_BATCH_SIZE};
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    items_total INTEGER DEFAULT 0,
    items_failed INTEGER DEFAULT 0,
    records_total INTEGER DEFAULT 0,
    writes_total INTEGER DEFAULT 0,
    writes_failed INTEGER DEFAULT 0,
    warnings INTEGER DEFAULT 0,
    stats_json TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS failed_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES sync_runs(id),
    item_id TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    status INTEGER,
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_failed_items_pipeline_run ON failed_items (pipeline, run_id);
";

/// `SQLite`-backed storage.
///
/// Create with [`SqliteStore::open`] for file-backed persistence or
/// [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    name: String,
    max_batch_size: usize,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory `SQLite` store (for tests and dry runs).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open an existing database for reading only. No file, directory or
    /// table is created; writes through this handle fail.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the database does not exist or
    /// can't be opened.
    pub fn open_read_only(path: &Path) -> error::Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            name: "sqlite".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            conn: Mutex::new(conn),
        })
    }

    fn from_connection(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            name: "sqlite".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            conn: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| iso.to_string(),
            |dt| dt.format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Read a single document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage or decode failure.
    pub fn get(&self, key: &DestinationKey) -> error::Result<Option<serde_json::Value>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT payload FROM documents WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|text| serde_json::from_str(&text).map_err(StateError::from))
            .transpose()
    }

    /// When a document was last written, as ISO-8601 UTC.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn updated_at(&self, key: &DestinationKey) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM documents WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| Self::sqlite_to_iso8601(&r)))
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, i64, Option<String>)> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT status, items_failed, writes_total, error_message FROM sync_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?)
    }

    /// Failed items logged for one run, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    pub fn failed_items(&self, pipeline: &str, run_id: i64) -> error::Result<Vec<FailedItem>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, error_kind, status, error_message, failed_at FROM failed_items \
             WHERE pipeline = ?1 AND run_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![pipeline, run_id], |row| {
            Ok(FailedItem {
                item_id: row.get(0)?,
                error_kind: row.get(1)?,
                status: row.get(2)?,
                error_message: row.get(3)?,
                failed_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl Destination for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn commit_batch(&self, ops: &[WriteOperation]) -> error::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let conn = self.lock_conn()?;
        let now = Self::now_sqlite();
        let tx = conn.unchecked_transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO documents (key, payload, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET payload = ?2, updated_at = ?3",
            )?;
            let mut delete = tx.prepare("DELETE FROM documents WHERE key = ?1")?;

            for op in ops {
                match op.kind {
                    WriteKind::Set => {
                        let payload = serde_json::to_string(&op.payload)?;
                        upsert.execute(rusqlite::params![op.key.as_str(), payload, now])?;
                    }
                    WriteKind::Delete => {
                        delete.execute([op.key.as_str()])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl BucketReader for SqliteStore {
    fn read_prefix(&self, prefix: &DestinationKey) -> error::Result<Vec<StoredDocument>> {
        let conn = self.lock_conn()?;
        let nested = format!("{}/", prefix.as_str());
        let mut stmt = conn.prepare(
            "SELECT key, payload FROM documents \
             WHERE ?1 = '' OR key = ?1 OR substr(key, 1, length(?2)) = ?2 \
             ORDER BY key",
        )?;
        let rows = stmt.query_map(rusqlite::params![prefix.as_str(), nested], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (key, payload) = row?;
            documents.push(StoredDocument {
                key: DestinationKey::new(key),
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(documents)
    }
}

impl RunLedger for SqliteStore {
    fn start_run(&self, pipeline: &str, mode: SyncMode) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_runs (pipeline, mode, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![pipeline, mode.as_str(), RunStatus::Running.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, stats: &RunStats) -> error::Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_runs SET status = ?1, finished_at = ?2, \
             items_total = ?3, items_failed = ?4, records_total = ?5, \
             writes_total = ?6, writes_failed = ?7, warnings = ?8, \
             stats_json = ?9, error_message = ?10 \
             WHERE id = ?11",
            rusqlite::params![
                stats.status.as_str(),
                Self::iso8601_to_sqlite(&stats.ended_at.to_rfc3339()),
                stats.extraction.total as i64,
                stats.extraction.failure as i64,
                stats.transformation.total as i64,
                stats.load.total as i64,
                stats.load.failure as i64,
                stats.warnings as i64,
                stats_json,
                stats.error_message,
                run_id,
            ],
        )?;
        Ok(())
    }

    fn record_failed_items(
        &self,
        pipeline: &str,
        run_id: i64,
        items: &[FailedItem],
    ) -> error::Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut count = 0u64;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO failed_items \
                 (pipeline, run_id, item_id, error_kind, status, error_message, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for item in items {
                stmt.execute(rusqlite::params![
                    pipeline,
                    run_id,
                    item.item_id,
                    item.error_kind,
                    item.status,
                    item.error_message,
                    item.failed_at,
                ])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }
}
