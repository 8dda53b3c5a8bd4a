//! Injected inference seams.
//!
//! The memory core never performs inference itself.  Extraction of candidate
//! facts from a batch of messages and the similarity / contradiction
//! judgments are delegated to implementations of the traits below, which may
//! be slow, unreliable, and non-deterministic.  Two judgments of the same
//! pair are not assumed to agree.

use async_trait::async_trait;
use thiserror::Error;

use crate::{CandidateFact, Fact, Judgment};

/// Errors an oracle may return.  All of them are recoverable from the
/// pipeline's point of view: the affected candidate is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle returned an unusable response: {0}")]
    BadResponse(String),
    #[error("oracle call timed out")]
    Timeout,
}

/// Turns one author's messages into zero or more candidate facts about them.
#[async_trait]
pub trait FactExtractionOracle: Send + Sync {
    async fn extract(&self, author_messages: &[String]) -> Result<Vec<CandidateFact>, OracleError>;
}

/// Ranks existing facts against a probe and judges candidate/fact pairs.
#[async_trait]
pub trait SimilarityOracle: Send + Sync {
    /// Score every fact in `corpus` against `probe`, highest first.
    ///
    /// Scores are in `[0.0, 1.0]`.  Implementations may omit facts they
    /// consider unrelated.
    async fn rank(&self, probe: &str, corpus: &[Fact]) -> Result<Vec<(Fact, f32)>, OracleError>;

    /// Decide whether `candidate` corroborates or contradicts `existing`.
    async fn judge(&self, existing: &Fact, candidate: &str) -> Result<Judgment, OracleError>;
}
