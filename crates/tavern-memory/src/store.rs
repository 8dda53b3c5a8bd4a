//! [`TenantStore`] – the durable storage unit behind one tenant.
//!
//! Each tenant owns exactly one directory on disk:
//!
//! ```text
//! <data_dir>/<tenant_id>_<sanitized name>/
//! ├── data.db        SQLite: short-term log + long-term facts
//! └── archive/       immutable JSON archive artifacts
//! ```
//!
//! The store is created and owned by the
//! [`TenantRegistry`][crate::registry::TenantRegistry]; everything else
//! borrows it through `Arc<TenantStore>` and works on one of the views
//! returned by [`short_term`][TenantStore::short_term],
//! [`facts`][TenantStore::facts] and [`archive`][TenantStore::archive].
//!
//! # Storage layout
//!
//! | table                    | contents                                    |
//! |--------------------------|---------------------------------------------|
//! | `short_term_message_log` | pending [`ShortTermRecord`]s, ordered by `seq` |
//! | `consolidated_message_ids` | ids of records already archived and truncated |
//! | `long_term_memory`       | [`Fact`] rows, active and superseded         |
//!
//! [`ShortTermRecord`]: tavern_types::ShortTermRecord
//! [`Fact`]: tavern_types::Fact

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tavern_types::{MemoryError, OracleError, TenantId};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::{ArchivalManager, ArchiveError};
use crate::facts::LongTermFactStore;
use crate::gate::RunGate;
use crate::short_term::ShortTermLog;

/// File name of the per-tenant SQLite database.
pub const DATA_FILE: &str = "data.db";
/// Name of the per-tenant archive sub-directory.
pub const ARCHIVE_DIR: &str = "archive";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from tenant store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Fact not found: {0}")]
    FactNotFound(Uuid),
    #[error("Fact {0} is not active")]
    FactNotActive(Uuid),
    #[error("Similarity oracle failed: {0}")]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Oracle(e) => MemoryError::OracleUnavailable(e.to_string()),
            other => MemoryError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TenantStats
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time counters for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantStats {
    pub short_term_records: usize,
    pub active_facts: usize,
    pub superseded_facts: usize,
    pub archives: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// TenantStore
// ─────────────────────────────────────────────────────────────────────────────

/// One tenant's durable storage unit.
///
/// The SQLite connection sits behind a mutex that is only ever held for a
/// single statement or transaction, never across an await point, so appends
/// proceed while a consolidation run waits on its oracles.
pub struct TenantStore {
    tenant_id: TenantId,
    display_name: String,
    dir: PathBuf,
    conn: Mutex<Connection>,
    gate: Arc<RunGate>,
    pub(crate) archive_seq: AtomicU64,
}

impl TenantStore {
    /// Open (or create) the storage unit rooted at `dir`.
    pub fn open(
        tenant_id: TenantId,
        display_name: impl Into<String>,
        dir: &Path,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.join(ARCHIVE_DIR))?;
        let conn = Connection::open(dir.join(DATA_FILE))?;
        let store = Self {
            tenant_id,
            display_name: display_name.into(),
            dir: dir.to_path_buf(),
            conn: Mutex::new(conn),
            gate: Arc::new(RunGate::new()),
            archive_seq: AtomicU64::new(0),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS short_term_message_log (
                seq                   INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id            TEXT NOT NULL UNIQUE,
                author_id             TEXT NOT NULL,
                author_display_name   TEXT NOT NULL,
                content               TEXT NOT NULL,
                timestamp             TEXT NOT NULL,
                directed_at_assistant INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS consolidated_message_ids (
                message_id TEXT NOT NULL PRIMARY KEY
             );
             CREATE TABLE IF NOT EXISTS long_term_memory (
                id                  TEXT NOT NULL PRIMARY KEY,
                content             TEXT NOT NULL,
                source_user_id      TEXT NOT NULL,
                source_display_name TEXT NOT NULL,
                category            TEXT,
                first_mentioned_at  TEXT NOT NULL,
                last_mentioned_at   TEXT NOT NULL,
                reference_count     INTEGER NOT NULL DEFAULT 1 CHECK (reference_count >= 1),
                status              TEXT NOT NULL DEFAULT 'active',
                superseded_by       TEXT REFERENCES long_term_memory (id)
             );
             CREATE INDEX IF NOT EXISTS idx_long_term_memory_source
                ON long_term_memory (source_user_id, status);",
        )?;
        Ok(())
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Display name the store was opened with.  Addressing only.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Root directory of this storage unit.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIR)
    }

    /// The tenant's "is-running" consolidation gate.
    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    pub fn short_term(&self) -> ShortTermLog<'_> {
        ShortTermLog::new(self)
    }

    pub fn facts(&self) -> LongTermFactStore<'_> {
        LongTermFactStore::new(self)
    }

    pub fn archive(&self) -> ArchivalManager<'_> {
        ArchivalManager::new(self)
    }

    pub fn stats(&self) -> Result<TenantStats, StoreError> {
        let (active_facts, superseded_facts) = self.facts().count_by_status()?;
        Ok(TenantStats {
            short_term_records: self.short_term().count()?,
            active_facts,
            superseded_facts,
            archives: self.archive().list()?.len(),
        })
    }

    /// Lock the connection.  A poisoned lock is recovered: every write is a
    /// single statement or transaction, so the connection is never left
    /// half-updated by a panicking holder.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("tenant_id", &self.tenant_id)
            .field("display_name", &self.display_name)
            .field("dir", &self.dir)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamp helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-width RFC-3339 so that stored timestamps sort lexically.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(idx, e.to_string(), rusqlite::types::Type::Text)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temp_store() -> (tempfile::TempDir, TenantStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::open(
            TenantId::new("1001").unwrap(),
            "Test Guild",
            &dir.path().join("1001_Test Guild"),
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_database_and_archive_dir() {
        let (_dir, store) = temp_store();
        assert!(store.dir().join(DATA_FILE).exists());
        assert!(store.archive_dir().is_dir());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7_Reopen");
        {
            let store = TenantStore::open(TenantId::from(7), "Reopen", &path).unwrap();
            store
                .conn()
                .execute(
                    "INSERT INTO short_term_message_log
                        (message_id, author_id, author_display_name, content, timestamp)
                     VALUES ('m1', 'u1', 'Ada', 'hi', '2024-01-01T00:00:00.000000Z')",
                    [],
                )
                .unwrap();
        }
        let store = TenantStore::open(TenantId::from(7), "Reopen", &path).unwrap();
        assert_eq!(store.short_term().count().unwrap(), 1);
    }

    #[test]
    fn stats_on_fresh_store_are_zero() {
        let (_dir, store) = temp_store();
        assert_eq!(store.stats().unwrap(), TenantStats::default());
    }

    #[test]
    fn timestamps_roundtrip_through_sql_text() {
        let now = Utc::now();
        let text = ts_to_sql(&now);
        let back = ts_from_sql(0, &text).unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn store_error_maps_oracle_failures_to_oracle_unavailable() {
        let err: MemoryError = StoreError::Oracle(OracleError::Timeout).into();
        assert!(matches!(err, MemoryError::OracleUnavailable(_)));
        let err: MemoryError = StoreError::FactNotFound(Uuid::nil()).into();
        assert!(matches!(err, MemoryError::Storage(_)));
    }
}
