//! [`ConsolidationPipeline`] – short-term to long-term memory consolidation.
//!
//! One run consolidates a tenant's short-term log:
//!
//! 1. **Gate** – acquire the tenant's [`RunGate`][tavern_memory::RunGate]
//!    (`Idle | Failed → Running`).  A trigger that finds the gate taken is
//!    coalesced into the active run.
//! 2. **Snapshot** – take a point-in-time copy of the log.  Records appended
//!    afterwards are left for the next pass.
//! 3. **Extract** – group the snapshot by author and ask the
//!    [`FactExtractionOracle`] for candidate facts per author.
//! 4. **Resolve** – for every candidate, find the author's best matching
//!    active fact above the similarity floor.  No match creates a fact; a
//!    match is judged once and either touched (corroborates) or superseded
//!    (contradicts).
//! 5. **Archive, then truncate** – write the snapshot as an archive artifact
//!    and only after that succeeds remove exactly the snapshotted records.
//! 6. **Re-check** – if the log has refilled past the ceiling while the pass
//!    ran, run another pass under the same permit; otherwise release the gate.
//!
//! Oracle calls are the only suspension points.  Each one is bounded by
//! [`ConsolidationConfig::oracle_timeout`] and retried up to
//! [`ConsolidationConfig::oracle_attempts`] times; a candidate whose calls
//! keep failing is dropped and counted, and the run carries on.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tavern_memory::TenantRegistry;
//! use tavern_runtime::consolidation::{ConsolidationConfig, ConsolidationPipeline};
//! use tavern_runtime::llm_oracle::LlmOracle;
//! use tavern_types::TenantId;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TenantRegistry::new("./data")?);
//! let oracle = Arc::new(LlmOracle::new("http://localhost:11434", "llama3"));
//! let pipeline = Arc::new(ConsolidationPipeline::new(
//!     Arc::clone(&registry),
//!     oracle.clone(),
//!     oracle,
//!     ConsolidationConfig::default(),
//! ));
//!
//! let tenant = TenantId::from(42);
//! registry.resolve(&tenant, "Dragon's Den")?;
//! if let Some(report) = pipeline.run(&tenant).await? {
//!     println!("{} facts created", report.facts_created);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tavern_memory::facts::Upsert;
use tavern_memory::validation::validate_fact;
use tavern_memory::{LongTermFactStore, RunPermit, StoreError, TenantRegistry, TenantStore};
use tavern_types::{
    CandidateFact, ConsolidationReport, FactExtractionOracle, Judgment, MemoryError, NewFact,
    OracleError, RunState, ShortTermRecord, SimilarityOracle, TenantId,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning knobs for [`ConsolidationPipeline`].
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    /// Short-term record count at which the automatic trigger fires.
    pub ceiling: usize,
    /// Minimum similarity score for an existing fact to count as a match.
    pub similarity_floor: f32,
    /// Upper bound on a single oracle call.
    pub oracle_timeout: Duration,
    /// Attempts per oracle call (at least one is always made).
    pub oracle_attempts: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            ceiling: 500,
            similarity_floor: 0.75,
            oracle_timeout: Duration::from_secs(60),
            oracle_attempts: 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trigger outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a trigger call.
pub enum TriggerOutcome {
    /// A run was started in the background; the handle yields its report.
    Scheduled(JoinHandle<Result<ConsolidationReport, MemoryError>>),
    /// A run was already active for the tenant and will re-check thresholds
    /// when it finishes.
    Coalesced,
    /// The short-term log is below the ceiling; nothing to do.
    BelowThreshold,
}

impl fmt::Debug for TriggerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerOutcome::Scheduled(_) => f.write_str("Scheduled"),
            TriggerOutcome::Coalesced => f.write_str("Coalesced"),
            TriggerOutcome::BelowThreshold => f.write_str("BelowThreshold"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-candidate errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why a single candidate was dropped.  Never escapes a run.
#[derive(Error, Debug)]
enum CandidateError {
    #[error(transparent)]
    Oracle(OracleError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<OracleError> for CandidateError {
    fn from(err: OracleError) -> Self {
        CandidateError::Oracle(err)
    }
}

impl From<StoreError> for CandidateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Oracle(e) => CandidateError::Oracle(e),
            other => CandidateError::Store(other),
        }
    }
}

enum Resolution {
    Created,
    Corroborated,
    Superseded,
}

/// One author's share of a snapshot.
struct AuthorBatch<'a> {
    author_id: &'a str,
    display_name: &'a str,
    texts: Vec<String>,
    last_mentioned_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ConsolidationPipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestrates consolidation runs for every tenant in a [`TenantRegistry`].
pub struct ConsolidationPipeline {
    registry: Arc<TenantRegistry>,
    extractor: Arc<dyn FactExtractionOracle>,
    similarity: Arc<dyn SimilarityOracle>,
    config: ConsolidationConfig,
}

impl ConsolidationPipeline {
    pub fn new(
        registry: Arc<TenantRegistry>,
        extractor: Arc<dyn FactExtractionOracle>,
        similarity: Arc<dyn SimilarityOracle>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            registry,
            extractor,
            similarity,
            config,
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Automatic trigger, called after every append.
    ///
    /// Schedules a run when the tenant's log has reached the ceiling and no
    /// run is active.
    pub fn on_message_appended(
        self: &Arc<Self>,
        tenant_id: &TenantId,
    ) -> Result<TriggerOutcome, MemoryError> {
        let store = self.store(tenant_id)?;
        let pending = store.short_term().count()?;
        if pending < self.config.ceiling.max(1) {
            return Ok(TriggerOutcome::BelowThreshold);
        }
        debug!(tenant = %tenant_id, pending, ceiling = self.config.ceiling, "short-term ceiling reached");
        Ok(self.schedule(store))
    }

    /// Manual trigger.  Idempotent alongside the automatic one: both share
    /// the tenant's gate.
    pub fn request_consolidation(
        self: &Arc<Self>,
        tenant_id: &TenantId,
    ) -> Result<TriggerOutcome, MemoryError> {
        let store = self.store(tenant_id)?;
        info!(tenant = %tenant_id, "consolidation requested");
        Ok(self.schedule(store))
    }

    /// Run consolidation for `tenant_id` on the current task.
    ///
    /// Returns `Ok(None)` when another run already holds the gate.
    pub async fn run(&self, tenant_id: &TenantId) -> Result<Option<ConsolidationReport>, MemoryError> {
        let store = self.store(tenant_id)?;
        let Some(permit) = store.gate().try_acquire() else {
            let rejected = MemoryError::ConcurrentRunRejected(tenant_id.to_string());
            debug!(tenant = %tenant_id, reason = %rejected, "run not started");
            return Ok(None);
        };
        self.run_with_permit(store, permit).await.map(Some)
    }

    /// The tenant's consolidation state.
    pub fn state(&self, tenant_id: &TenantId) -> Result<RunState, MemoryError> {
        Ok(self.store(tenant_id)?.gate().state())
    }

    fn store(&self, tenant_id: &TenantId) -> Result<Arc<TenantStore>, MemoryError> {
        self.registry
            .get(tenant_id)
            .ok_or_else(|| MemoryError::TenantNotActive(tenant_id.to_string()))
    }

    fn schedule(self: &Arc<Self>, store: Arc<TenantStore>) -> TriggerOutcome {
        let Some(permit) = store.gate().try_acquire() else {
            debug!(tenant = %store.tenant_id(), "run already active; trigger coalesced");
            return TriggerOutcome::Coalesced;
        };
        let pipeline = Arc::clone(self);
        TriggerOutcome::Scheduled(tokio::spawn(async move {
            pipeline.run_with_permit(store, permit).await
        }))
    }

    #[instrument(name = "consolidation", skip_all, fields(tenant = %store.tenant_id()))]
    async fn run_with_permit(
        &self,
        store: Arc<TenantStore>,
        mut permit: RunPermit,
    ) -> Result<ConsolidationReport, MemoryError> {
        let mut report = ConsolidationReport::for_tenant(store.tenant_id().clone());
        loop {
            if let Err(e) = self.pass(&store, &mut report).await {
                warn!(error = %e, passes = report.passes, "consolidation pass failed; log left intact");
                permit.fail(e.to_string());
                return Err(e);
            }
            report.passes += 1;

            let pending = match store.short_term().count() {
                Ok(n) => n,
                Err(e) => {
                    let e = MemoryError::from(e);
                    permit.fail(e.to_string());
                    return Err(e);
                }
            };
            if pending >= self.config.ceiling.max(1) {
                info!(pending, "short-term log refilled during run; starting another pass");
                continue;
            }

            permit.complete();
            match self.reacquire_if_refilled(&store) {
                Some(next) => permit = next,
                None => break,
            }
        }
        info!(
            passes = report.passes,
            records_archived = report.records_archived,
            facts_created = report.facts_created,
            facts_corroborated = report.facts_corroborated,
            facts_superseded = report.facts_superseded,
            candidates_skipped = report.candidates_skipped,
            "consolidation complete"
        );
        Ok(report)
    }

    /// Re-check the ceiling after the gate was released.
    ///
    /// A trigger that arrived between the last count and the release was
    /// coalesced against a gate that was still running, so nothing else will
    /// pick those records up.
    fn reacquire_if_refilled(&self, store: &TenantStore) -> Option<RunPermit> {
        let pending = match store.short_term().count() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not re-check short-term ceiling");
                return None;
            }
        };
        if pending < self.config.ceiling.max(1) {
            return None;
        }
        let permit = store.gate().try_acquire()?;
        info!(pending, "ceiling reached while releasing the gate; starting another pass");
        Some(permit)
    }

    /// One snapshot → archive → truncate cycle.
    async fn pass(&self, store: &TenantStore, report: &mut ConsolidationReport) -> Result<(), MemoryError> {
        let snapshot = store.short_term().snapshot()?;
        if snapshot.is_empty() {
            debug!("short-term log empty; nothing to consolidate");
            return Ok(());
        }

        let facts = store.facts();
        for author in group_by_author(&snapshot.records) {
            let candidates = match self
                .bounded("extract", || self.extractor.extract(&author.texts))
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(author = author.author_id, error = %e, "fact extraction failed; skipping author");
                    report.candidates_skipped += 1;
                    continue;
                }
            };

            for candidate in candidates {
                if let Err(e) = validate_fact(&candidate.content) {
                    debug!(author = author.author_id, error = %e, "discarding invalid candidate");
                    report.candidates_skipped += 1;
                    continue;
                }
                match self.resolve(facts, &author, candidate).await {
                    Ok(Resolution::Created) => report.facts_created += 1,
                    Ok(Resolution::Corroborated) => report.facts_corroborated += 1,
                    Ok(Resolution::Superseded) => report.facts_superseded += 1,
                    Err(e) => {
                        warn!(author = author.author_id, error = %e, "candidate dropped");
                        report.candidates_skipped += 1;
                    }
                }
            }
        }

        let archive_id = store.archive().archive(&snapshot.records)?;
        let removed = store.short_term().truncate(snapshot.boundary)?;
        debug!(archive_id = %archive_id, removed, "short-term log truncated");

        report.records_archived += snapshot.len();
        report.archive_ids.push(archive_id);
        Ok(())
    }

    async fn resolve(
        &self,
        facts: LongTermFactStore<'_>,
        author: &AuthorBatch<'_>,
        candidate: CandidateFact,
    ) -> Result<Resolution, CandidateError> {
        let new = NewFact {
            content: candidate.content,
            source_user_id: author.author_id.to_string(),
            source_display_name: author.display_name.to_string(),
            category: candidate.category,
            mentioned_at: author.last_mentioned_at,
        };

        let floor = self.config.similarity_floor;
        let hits = self
            .bounded("rank", || {
                facts.find_candidates(&new.content, author.author_id, self.similarity.as_ref(), floor)
            })
            .await?;

        // Only the best match is judged.
        let Some((existing, score)) = hits.into_iter().next() else {
            return Ok(match facts.upsert_new(&new)? {
                Upsert::Created(fact) => {
                    debug!(fact_id = %fact.id, "fact created");
                    Resolution::Created
                }
                Upsert::Existing(fact) => {
                    debug!(fact_id = %fact.id, "exact duplicate corroborated");
                    Resolution::Corroborated
                }
            });
        };

        let verdict = self
            .bounded("judge", || self.similarity.judge(&existing, &new.content))
            .await?;
        match verdict {
            Judgment::Corroborates => {
                let fact = facts.touch_at(existing.id, author.last_mentioned_at)?;
                debug!(fact_id = %fact.id, score, reference_count = fact.reference_count, "fact corroborated");
                Ok(Resolution::Corroborated)
            }
            Judgment::Contradicts => {
                let fact = facts.supersede(existing.id, &new)?;
                debug!(old_fact_id = %existing.id, fact_id = %fact.id, score, "fact superseded");
                Ok(Resolution::Superseded)
            }
        }
    }

    /// Run an oracle-bound call under the timeout / attempts policy.
    ///
    /// Storage errors are returned immediately; only oracle failures retry.
    async fn bounded<T, E, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, CandidateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<CandidateError>,
    {
        let attempts = self.config.oracle_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.config.oracle_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e.into(),
                Err(_) => CandidateError::Oracle(OracleError::Timeout),
            };
            if matches!(err, CandidateError::Store(_)) || attempt >= attempts {
                return Err(err);
            }
            debug!(op, attempt, error = %err, "oracle call failed; retrying");
        }
    }
}

/// Group records by author in order of first appearance.
fn group_by_author(records: &[ShortTermRecord]) -> Vec<AuthorBatch<'_>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut batches: Vec<AuthorBatch<'_>> = Vec::new();
    for record in records {
        let slot = *index.entry(record.author_id.as_str()).or_insert_with(|| {
            batches.push(AuthorBatch {
                author_id: record.author_id.as_str(),
                display_name: record.author_display_name.as_str(),
                texts: Vec::new(),
                last_mentioned_at: record.timestamp,
            });
            batches.len() - 1
        });
        let batch = &mut batches[slot];
        // Latest display name wins.
        batch.display_name = record.author_display_name.as_str();
        batch.last_mentioned_at = batch.last_mentioned_at.max(record.timestamp);
        batch.texts.push(record.text.clone());
    }
    batches
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
