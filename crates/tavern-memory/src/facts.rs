//! Long-Term Fact Store.
//!
//! Durable per-tenant table of [`Fact`]s.  Facts are never deleted: a fact
//! that is contradicted is marked [`FactStatus::Superseded`] and points at
//! its active replacement.  Every mutation below is independently atomic
//! (one statement or one transaction).
//!
//! # Invariants
//!
//! - `reference_count >= 1` (enforced by a `CHECK` constraint as well).
//! - A superseded fact's `superseded_by` always names an **active** fact.
//!   [`LongTermFactStore::supersede`] re-points older links that targeted
//!   the fact being replaced, so chains never dangle and never cycle.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use tavern_memory::facts::Upsert;
//! use tavern_memory::store::TenantStore;
//! use tavern_types::{FactStatus, NewFact, TenantId};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = TenantStore::open(TenantId::from(1), "Guild", dir.path()).unwrap();
//! let facts = store.facts();
//!
//! let new = |content: &str| NewFact {
//!     content: content.into(),
//!     source_user_id: "u1".into(),
//!     source_display_name: "Ada".into(),
//!     category: Some("preference".into()),
//!     mentioned_at: Utc::now(),
//! };
//!
//! let Upsert::Created(blue) = facts.upsert_new(&new("favorite color is blue")).unwrap() else {
//!     unreachable!()
//! };
//! let red = facts.supersede(blue.id, &new("favorite color is red")).unwrap();
//!
//! let old = facts.get(blue.id).unwrap();
//! assert_eq!(old.status, FactStatus::Superseded);
//! assert_eq!(old.superseded_by, Some(red.id));
//! assert_eq!(red.reference_count, 2);
//! ```

use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tavern_types::{Fact, FactStatus, NewFact, SimilarityOracle};
use tracing::debug;
use uuid::Uuid;

use crate::store::{StoreError, TenantStore, ts_from_sql, ts_to_sql};

const FACT_COLUMNS: &str = "id, content, source_user_id, source_display_name, category,
    first_mentioned_at, last_mentioned_at, reference_count, status, superseded_by";

/// Outcome of [`LongTermFactStore::upsert_new`].
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    /// A new active fact was inserted.
    Created(Fact),
    /// An identical active fact already existed and was touched instead.
    Existing(Fact),
}

impl Upsert {
    pub fn fact(&self) -> &Fact {
        match self {
            Upsert::Created(f) | Upsert::Existing(f) => f,
        }
    }

    pub fn into_fact(self) -> Fact {
        match self {
            Upsert::Created(f) | Upsert::Existing(f) => f,
        }
    }
}

/// View over a tenant's long-term facts.
#[derive(Clone, Copy)]
pub struct LongTermFactStore<'a> {
    store: &'a TenantStore,
}

impl<'a> LongTermFactStore<'a> {
    pub(crate) fn new(store: &'a TenantStore) -> Self {
        Self { store }
    }

    /// Store `new` as a fresh active fact with `reference_count = 1`.
    ///
    /// If the same source user already has an active fact whose content is
    /// identical up to case and whitespace, that fact is touched instead and
    /// returned as [`Upsert::Existing`].
    pub fn upsert_new(&self, new: &NewFact) -> Result<Upsert, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let wanted = normalize(&new.content);
        let duplicate = query_facts(
            &tx,
            "WHERE source_user_id = ?1 AND status = 'active'",
            params![new.source_user_id],
        )?
        .into_iter()
        .find(|f| normalize(&f.content) == wanted);

        let mentioned_at = new.mentioned_at.trunc_subsecs(6);
        let outcome = match duplicate {
            Some(existing) => Upsert::Existing(touch_in(&tx, existing.id, mentioned_at)?),
            None => {
                let fact = Fact {
                    id: Uuid::new_v4(),
                    content: new.content.clone(),
                    source_user_id: new.source_user_id.clone(),
                    source_display_name: new.source_display_name.clone(),
                    category: new.category.clone(),
                    first_mentioned_at: mentioned_at,
                    last_mentioned_at: mentioned_at,
                    reference_count: 1,
                    status: FactStatus::Active,
                    superseded_by: None,
                };
                insert_fact(&tx, &fact)?;
                Upsert::Created(fact)
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Replace the active fact `old_id` with `new`.
    ///
    /// The old fact becomes superseded and points at the new one; the new
    /// fact inherits `first_mentioned_at` and gets
    /// `reference_count = old.reference_count + 1`.  Facts that were
    /// already superseded by `old_id` are re-pointed at the new fact.
    pub fn supersede(&self, old_id: Uuid, new: &NewFact) -> Result<Fact, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let old = get_in(&tx, old_id)?;
        if !old.is_active() {
            return Err(StoreError::FactNotActive(old_id));
        }
        let fact = Fact {
            id: Uuid::new_v4(),
            content: new.content.clone(),
            source_user_id: new.source_user_id.clone(),
            source_display_name: new.source_display_name.clone(),
            category: new.category.clone().or(old.category),
            first_mentioned_at: old.first_mentioned_at,
            last_mentioned_at: new.mentioned_at.trunc_subsecs(6).max(old.last_mentioned_at),
            reference_count: old.reference_count.saturating_add(1),
            status: FactStatus::Active,
            superseded_by: None,
        };
        insert_fact(&tx, &fact)?;
        tx.execute(
            "UPDATE long_term_memory
             SET status = 'superseded', superseded_by = ?1
             WHERE id = ?2 OR (status = 'superseded' AND superseded_by = ?2)",
            params![fact.id.to_string(), old_id.to_string()],
        )?;
        tx.commit()?;
        debug!(old = %old_id, new = %fact.id, "fact superseded");
        Ok(fact)
    }

    /// Increment `reference_count` and set `last_mentioned_at` to now.
    pub fn touch(&self, id: Uuid) -> Result<Fact, StoreError> {
        self.touch_at(id, Utc::now())
    }

    /// Like [`touch`][Self::touch] with an explicit mention time.
    /// `last_mentioned_at` never moves backwards.
    pub fn touch_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<Fact, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let fact = touch_in(&tx, id, at)?;
        tx.commit()?;
        Ok(fact)
    }

    pub fn get(&self, id: Uuid) -> Result<Fact, StoreError> {
        get_in(&self.store.conn(), id)
    }

    /// Active facts sourced from `user_id`, oldest first.
    pub fn active_facts_for(&self, user_id: &str) -> Result<Vec<Fact>, StoreError> {
        query_facts(
            &self.store.conn(),
            "WHERE source_user_id = ?1 AND status = 'active'",
            params![user_id],
        )
    }

    pub fn facts_for_user(
        &self,
        user_id: &str,
        include_superseded: bool,
    ) -> Result<Vec<Fact>, StoreError> {
        if include_superseded {
            query_facts(
                &self.store.conn(),
                "WHERE source_user_id = ?1",
                params![user_id],
            )
        } else {
            self.active_facts_for(user_id)
        }
    }

    /// Every active fact in the tenant, oldest first.
    pub fn all_active(&self) -> Result<Vec<Fact>, StoreError> {
        query_facts(&self.store.conn(), "WHERE status = 'active'", [])
    }

    /// `(active, superseded)` fact counts.
    pub fn count_by_status(&self) -> Result<(usize, usize), StoreError> {
        let conn = self.store.conn();
        let (active, superseded): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'superseded' THEN 1 ELSE 0 END), 0)
             FROM long_term_memory",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((active as usize, superseded as usize))
    }

    /// Rank `source_user_id`'s active facts against `probe` with `oracle`.
    ///
    /// Only hits scoring at least `floor` are returned, highest first.  Facts
    /// the oracle invents or returns for other users are discarded, and the
    /// stored version of each fact is returned rather than the oracle's copy.
    pub async fn find_candidates(
        &self,
        probe: &str,
        source_user_id: &str,
        oracle: &dyn SimilarityOracle,
        floor: f32,
    ) -> Result<Vec<(Fact, f32)>, StoreError> {
        let corpus = self.active_facts_for(source_user_id)?;
        if corpus.is_empty() {
            return Ok(Vec::new());
        }
        let ranked = oracle.rank(probe, &corpus).await?;

        let mut by_id: HashMap<Uuid, Fact> = corpus.into_iter().map(|f| (f.id, f)).collect();
        let mut hits: Vec<(Fact, f32)> = ranked
            .into_iter()
            .filter(|(_, score)| score.is_finite() && *score >= floor)
            .filter_map(|(f, score)| by_id.remove(&f.id).map(|stored| (stored, score)))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(hits)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection-level helpers (callable inside a transaction)
// ─────────────────────────────────────────────────────────────────────────────

fn insert_fact(conn: &Connection, fact: &Fact) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO long_term_memory
            (id, content, source_user_id, source_display_name, category,
             first_mentioned_at, last_mentioned_at, reference_count, status, superseded_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            fact.id.to_string(),
            fact.content,
            fact.source_user_id,
            fact.source_display_name,
            fact.category,
            ts_to_sql(&fact.first_mentioned_at),
            ts_to_sql(&fact.last_mentioned_at),
            fact.reference_count,
            fact.status.as_str(),
            fact.superseded_by.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

fn touch_in(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<Fact, StoreError> {
    let fact = get_in(conn, id)?;
    if !fact.is_active() {
        return Err(StoreError::FactNotActive(id));
    }
    let last = at.trunc_subsecs(6).max(fact.last_mentioned_at);
    conn.execute(
        "UPDATE long_term_memory
         SET reference_count = reference_count + 1, last_mentioned_at = ?1
         WHERE id = ?2",
        params![ts_to_sql(&last), id.to_string()],
    )?;
    Ok(Fact {
        reference_count: fact.reference_count.saturating_add(1),
        last_mentioned_at: last,
        ..fact
    })
}

fn get_in(conn: &Connection, id: Uuid) -> Result<Fact, StoreError> {
    conn.query_row(
        &format!("SELECT {FACT_COLUMNS} FROM long_term_memory WHERE id = ?1"),
        params![id.to_string()],
        row_to_fact,
    )
    .optional()?
    .ok_or(StoreError::FactNotFound(id))
}

fn query_facts<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<Fact>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM long_term_memory {filter} ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map(params, row_to_fact)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::Sqlite)
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let id: String = row.get(0)?;
    let first: String = row.get(5)?;
    let last: String = row.get(6)?;
    let status: String = row.get(8)?;
    let superseded_by: Option<String> = row.get(9)?;
    Ok(Fact {
        id: parse_uuid(0, &id)?,
        content: row.get(1)?,
        source_user_id: row.get(2)?,
        source_display_name: row.get(3)?,
        category: row.get(4)?,
        first_mentioned_at: ts_from_sql(5, &first)?,
        last_mentioned_at: ts_from_sql(6, &last)?,
        reference_count: row.get(7)?,
        status: FactStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(8, status.clone(), rusqlite::types::Type::Text)
        })?,
        superseded_by: superseded_by.map(|s| parse_uuid(9, &s)).transpose()?,
    })
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::InvalidColumnType(idx, e.to_string(), rusqlite::types::Type::Text)
    })
}

/// Lower-cased, whitespace-collapsed form used for exact-duplicate detection.
fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
