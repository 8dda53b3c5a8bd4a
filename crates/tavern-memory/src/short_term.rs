//! Short-Term Log.
//!
//! An append-only, per-tenant buffer of inbound messages awaiting
//! consolidation.  The log spans the whole tenant; it is not partitioned by
//! channel or author.
//!
//! Records are ordered by an internal monotonically increasing `seq`.  A
//! [`Snapshot`] captures every record up to a [`SnapshotBoundary`]; a later
//! [`ShortTermLog::truncate`] with that boundary removes exactly those
//! records, so anything appended after the snapshot survives.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use tavern_memory::store::TenantStore;
//! use tavern_types::{ShortTermRecord, TenantId};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = TenantStore::open(TenantId::from(1), "Guild", dir.path()).unwrap();
//! let log = store.short_term();
//!
//! let record = ShortTermRecord {
//!     message_id: "m1".into(),
//!     author_id: "u1".into(),
//!     author_display_name: "Ada".into(),
//!     text: "I just adopted a cat".into(),
//!     timestamp: Utc::now(),
//!     directed_at_assistant: false,
//! };
//! log.append(&record).unwrap();
//!
//! let snapshot = log.snapshot().unwrap();
//! log.append(&ShortTermRecord { message_id: "m2".into(), ..record }).unwrap();
//! log.truncate(snapshot.boundary).unwrap();
//! assert_eq!(log.count().unwrap(), 1); // m2 survives
//! ```

use rusqlite::params;
use tavern_types::ShortTermRecord;

use crate::store::{StoreError, TenantStore, ts_from_sql, ts_to_sql};

/// Highest `seq` included in a [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotBoundary(i64);

impl SnapshotBoundary {
    /// Boundary of an empty snapshot; truncating with it removes nothing.
    pub const EMPTY: SnapshotBoundary = SnapshotBoundary(0);
}

/// A point-in-time, ordered copy of the short-term log.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub records: Vec<ShortTermRecord>,
    pub boundary: SnapshotBoundary,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// View over a tenant's short-term log.
#[derive(Clone, Copy)]
pub struct ShortTermLog<'a> {
    store: &'a TenantStore,
}

impl<'a> ShortTermLog<'a> {
    pub(crate) fn new(store: &'a TenantStore) -> Self {
        Self { store }
    }

    /// Append `record`.
    ///
    /// Returns `false` (and stores nothing) when a record with the same
    /// `message_id` is already pending or was consolidated earlier, so
    /// redelivered messages are harmless.
    pub fn append(&self, record: &ShortTermRecord) -> Result<bool, StoreError> {
        let inserted = self.store.conn().execute(
            "INSERT OR IGNORE INTO short_term_message_log
                (message_id, author_id, author_display_name, content, timestamp, directed_at_assistant)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE NOT EXISTS (SELECT 1 FROM consolidated_message_ids WHERE message_id = ?1)",
            params![
                record.message_id,
                record.author_id,
                record.author_display_name,
                record.text,
                ts_to_sql(&record.timestamp),
                record.directed_at_assistant,
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Take an ordered snapshot of every pending record.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, message_id, author_id, author_display_name, content, timestamp, directed_at_assistant
             FROM short_term_message_log
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        let mut boundary = SnapshotBoundary::EMPTY;
        for row in rows {
            let (seq, record) = row?;
            boundary = SnapshotBoundary(seq);
            records.push(record);
        }
        Ok(Snapshot { records, boundary })
    }

    /// Remove every record at or below `upto`.  Returns the number removed.
    ///
    /// The removed message ids are remembered in the same transaction so a
    /// later redelivery of an archived message is rejected by [`append`].
    ///
    /// [`append`]: ShortTermLog::append
    pub fn truncate(&self, upto: SnapshotBoundary) -> Result<usize, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO consolidated_message_ids (message_id)
             SELECT message_id FROM short_term_message_log WHERE seq <= ?1",
            params![upto.0],
        )?;
        let removed = tx.execute(
            "DELETE FROM short_term_message_log WHERE seq <= ?1",
            params![upto.0],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM short_term_message_log",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The newest `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ShortTermRecord>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, message_id, author_id, author_display_name, content, timestamp, directed_at_assistant
             FROM short_term_message_log
             ORDER BY seq DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut records = rows
            .map(|r| r.map(|(_, record)| record))
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, ShortTermRecord)> {
    let seq: i64 = row.get(0)?;
    let ts: String = row.get(5)?;
    Ok((
        seq,
        ShortTermRecord {
            message_id: row.get(1)?,
            author_id: row.get(2)?,
            author_display_name: row.get(3)?,
            text: row.get(4)?,
            timestamp: ts_from_sql(5, &ts)?,
            directed_at_assistant: row.get(6)?,
        },
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::store::tests::temp_store;

    fn record(id: &str, author: &str, text: &str) -> ShortTermRecord {
        ShortTermRecord {
            message_id: id.to_string(),
            author_id: author.to_string(),
            author_display_name: format!("name-{author}"),
            text: text.to_string(),
            timestamp: Utc::now(),
            directed_at_assistant: false,
        }
    }

    #[test]
    fn append_increments_count() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        assert_eq!(log.count().unwrap(), 0);
        assert!(log.append(&record("m1", "u1", "hello")).unwrap());
        assert!(log.append(&record("m2", "u2", "hey")).unwrap());
        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn duplicate_message_id_is_ignored() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        assert!(log.append(&record("m1", "u1", "first")).unwrap());
        assert!(!log.append(&record("m1", "u1", "again")).unwrap());
        let snap = log.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.records[0].text, "first");
    }

    #[test]
    fn snapshot_preserves_append_order_and_fields() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        let mut directed = record("m1", "u1", "hey bot");
        directed.directed_at_assistant = true;
        directed.timestamp = Utc::now() - Duration::minutes(5);
        log.append(&directed).unwrap();
        log.append(&record("m2", "u2", "second")).unwrap();

        let snap = log.snapshot().unwrap();
        assert_eq!(snap.records[0].message_id, "m1");
        assert!(snap.records[0].directed_at_assistant);
        assert_eq!(
            snap.records[0].timestamp.timestamp_micros(),
            directed.timestamp.timestamp_micros()
        );
        assert_eq!(snap.records[1].message_id, "m2");
    }

    #[test]
    fn truncate_removes_only_snapshotted_records() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        for i in 0..5 {
            log.append(&record(&format!("m{i}"), "u1", "before")).unwrap();
        }
        let snap = log.snapshot().unwrap();
        log.append(&record("late-1", "u1", "after")).unwrap();
        log.append(&record("late-2", "u2", "after")).unwrap();

        assert_eq!(log.truncate(snap.boundary).unwrap(), 5);
        let remaining = log.snapshot().unwrap();
        let ids: Vec<_> = remaining.records.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, ["late-1", "late-2"]);
    }

    #[test]
    fn consolidated_message_id_is_not_accepted_again() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        assert!(log.append(&record("m1", "u1", "hello")).unwrap());
        let snap = log.snapshot().unwrap();
        store.archive().archive(&snap.records).unwrap();
        log.truncate(snap.boundary).unwrap();

        assert!(!log.append(&record("m1", "u1", "hello")).unwrap());
        assert_eq!(log.count().unwrap(), 0);
        assert!(log.append(&record("m2", "u1", "new")).unwrap());
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn truncate_with_empty_boundary_is_noop() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        let empty = log.snapshot().unwrap();
        assert!(empty.is_empty());
        log.append(&record("m1", "u1", "x")).unwrap();
        assert_eq!(log.truncate(empty.boundary).unwrap(), 0);
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn recent_returns_newest_in_chronological_order() {
        let (_dir, store) = temp_store();
        let log = store.short_term();
        for i in 0..6 {
            log.append(&record(&format!("m{i}"), "u1", "x")).unwrap();
        }
        let recent = log.recent(3).unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, ["m3", "m4", "m5"]);
    }
}
