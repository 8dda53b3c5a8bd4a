//! `tavern-types` – shared vocabulary for the Tavern memory stack.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here: tenant identifiers, short-term records, long-term facts, archive
//! batches, consolidation reports, and the global [`MemoryError`] taxonomy.
//! The oracle seams ([`oracle::FactExtractionOracle`] and
//! [`oracle::SimilarityOracle`]) also live here so that the storage crate can
//! delegate ranking without depending on the runtime.

pub mod oracle;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use oracle::{FactExtractionOracle, OracleError, SimilarityOracle};

// ─────────────────────────────────────────────────────────────────────────────
// Tenant identity
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, stable identifier of a tenant (one isolated community).
///
/// Only ASCII alphanumerics and `-` are accepted so that the id can be used
/// verbatim as the prefix of a storage directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

/// Returned when a string cannot be used as a [`TenantId`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid tenant id {0:?}: expected ASCII letters, digits or '-'")]
pub struct InvalidTenantId(pub String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(Self(raw))
        } else {
            Err(InvalidTenantId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl From<u64> for TenantId {
    /// Numeric platform ids (e.g. chat-server snowflakes) are always valid.
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Short-term log
// ─────────────────────────────────────────────────────────────────────────────

/// One inbound chat message awaiting consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermRecord {
    /// Platform message id, unique within a tenant.
    pub message_id: String,
    pub author_id: String,
    /// Author's display name at the time the message was sent.
    pub author_display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// `true` when the message was addressed to the assistant.
    pub directed_at_assistant: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Long-term facts
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Fact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    Active,
    Superseded,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Active => "active",
            FactStatus::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FactStatus::Active),
            "superseded" => Some(FactStatus::Superseded),
            _ => None,
        }
    }
}

/// A durable, attributed, reference-counted unit of long-term knowledge.
///
/// A fact with [`FactStatus::Superseded`] always carries a `superseded_by`
/// pointing at an active fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub content: String,
    pub source_user_id: String,
    /// The source user's display name when the fact was recorded.
    pub source_display_name: String,
    pub category: Option<String>,
    pub first_mentioned_at: DateTime<Utc>,
    pub last_mentioned_at: DateTime<Utc>,
    /// Number of times the fact has been stated or corroborated; never 0.
    pub reference_count: u32,
    pub status: FactStatus,
    pub superseded_by: Option<Uuid>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }
}

/// The caller-supplied part of a fact about to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFact {
    pub content: String,
    pub source_user_id: String,
    pub source_display_name: String,
    pub category: Option<String>,
    pub mentioned_at: DateTime<Utc>,
}

/// A candidate fact string produced by a [`FactExtractionOracle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CandidateFact {
    /// Third-person statement about the author, e.g. "favorite color is red".
    pub content: String,
    /// Optional free-form grouping such as "preference" or "hobby".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl CandidateFact {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: None,
        }
    }
}

impl From<&str> for CandidateFact {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

/// Verdict of a [`SimilarityOracle::judge`] call on an (existing, candidate) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Judgment {
    /// The candidate restates or confirms the existing fact.
    Corroborates,
    /// The candidate replaces the existing fact.
    Contradicts,
}

// ─────────────────────────────────────────────────────────────────────────────
// Archives
// ─────────────────────────────────────────────────────────────────────────────

/// Unique name of an archive artifact (its file stem).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(pub String);

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable snapshot of consolidated short-term records.
///
/// Serialises to the archive artifact contract
/// `{ "archived_at", "message_count", "messages" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveBatch {
    pub archived_at: DateTime<Utc>,
    #[serde(rename = "message_count")]
    pub record_count: usize,
    #[serde(rename = "messages")]
    pub records: Vec<ShortTermRecord>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Consolidation
// ─────────────────────────────────────────────────────────────────────────────

/// Per-tenant consolidation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    /// The last run aborted; the next trigger may retry.
    Failed { reason: String },
}

/// Final report of one consolidation run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub tenant_id: Option<TenantId>,
    /// Number of snapshot passes performed (threshold re-evaluation may add more).
    pub passes: u32,
    pub records_archived: usize,
    pub facts_created: usize,
    pub facts_corroborated: usize,
    pub facts_superseded: usize,
    /// Candidates (or whole author extractions) dropped after oracle or
    /// validation failures.
    pub candidates_skipped: usize,
    pub archive_ids: Vec<ArchiveId>,
}

impl ConsolidationReport {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// Tenant-scoped failures surfaced by the memory pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryError {
    /// The tenant's storage unit could not be created or opened.
    #[error("Storage unavailable for tenant {tenant}: {details}")]
    StorageUnavailable { tenant: String, details: String },

    /// An oracle call failed; the affected candidate is dropped.
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// The archive artifact was not durably written; the log is untouched.
    #[error("Archival write failed: {0}")]
    ArchivalWriteFailed(String),

    /// A consolidation run is already active for this tenant.
    #[error("Consolidation already running for tenant {0}")]
    ConcurrentRunRejected(String),

    /// The tenant has not been resolved in this process yet.
    #[error("Tenant {0} is not active")]
    TenantNotActive(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
