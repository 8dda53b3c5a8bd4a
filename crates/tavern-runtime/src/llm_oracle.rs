//! [`LlmOracle`] – oracle implementations backed by [`LlmDriver`].
//!
//! - Extraction asks the model for `{ "facts": [{ "content", "category" }] }`.
//! - Ranking is local: a position-weighted Jaccard similarity between the
//!   probe and each fact, so no model call is spent on it.  Leading tokens
//!   carry the subject of a fact ("favorite color is ..."), so they weigh
//!   more and two statements about the same subject land above the default
//!   similarity floor even when their values differ.
//! - Judgment asks the model for `{ "verdict": "corroborates" | "contradicts" }`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tavern_types::{CandidateFact, Fact, FactExtractionOracle, Judgment, OracleError, SimilarityOracle};
use tracing::debug;

use crate::llm_driver::{ChatMessage, LlmDriver, LlmError, Role};

const EXTRACTION_PROMPT: &str = "\
You maintain long-term memory about members of a chat community. \
From the messages below, all written by the same person, extract durable facts \
about that person: preferences, relationships, occupation, hobbies, plans. \
Write each fact as a short third-person statement without the person's name. \
Category is one of: preference, personal, relationship, activity, other. \
Return an empty list when nothing durable was said.";

const JUDGE_PROMPT: &str = "\
You compare a stored fact about a person with a newly extracted statement about \
the same person. Answer \"corroborates\" if the statement agrees with or \
restates the fact, or \"contradicts\" if it replaces or conflicts with it.";

#[derive(Deserialize, JsonSchema)]
struct ExtractionReply {
    facts: Vec<CandidateFact>,
}

#[derive(Deserialize, JsonSchema)]
struct JudgeReply {
    verdict: Judgment,
}

impl From<LlmError> for OracleError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Http(e) if e.is_timeout() => OracleError::Timeout,
            LlmError::Http(e) => OracleError::Unavailable(e.to_string()),
            LlmError::BadResponse(msg) => OracleError::BadResponse(msg),
        }
    }
}

/// An LLM-backed [`FactExtractionOracle`] and [`SimilarityOracle`].
pub struct LlmOracle {
    driver: LlmDriver,
}

impl LlmOracle {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_driver(LlmDriver::new(base_url, model))
    }

    pub fn with_driver(driver: LlmDriver) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl FactExtractionOracle for LlmOracle {
    async fn extract(&self, author_messages: &[String]) -> Result<Vec<CandidateFact>, OracleError> {
        if author_messages.is_empty() {
            return Ok(Vec::new());
        }
        let transcript = author_messages
            .iter()
            .map(|m| format!("- {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = [
            ChatMessage {
                role: Role::System,
                content: EXTRACTION_PROMPT.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: transcript,
            },
        ];
        let reply: ExtractionReply = self.driver.complete_json(&messages).await?;
        debug!(model = self.driver.model(), candidates = reply.facts.len(), "facts extracted");
        Ok(reply.facts)
    }
}

#[async_trait]
impl SimilarityOracle for LlmOracle {
    async fn rank(&self, probe: &str, corpus: &[Fact]) -> Result<Vec<(Fact, f32)>, OracleError> {
        let mut ranked: Vec<(Fact, f32)> = corpus
            .iter()
            .map(|f| (f.clone(), lexical_similarity(probe, &f.content)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    async fn judge(&self, existing: &Fact, candidate: &str) -> Result<Judgment, OracleError> {
        let messages = [
            ChatMessage {
                role: Role::System,
                content: JUDGE_PROMPT.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: format!("Stored fact: {}\nNew statement: {candidate}", existing.content),
            },
        ];
        let reply: JudgeReply = self.driver.complete_json(&messages).await?;
        Ok(reply.verdict)
    }
}

/// Weighted Jaccard similarity of the lower-cased alphanumeric tokens of `a`
/// and `b`.
///
/// A token's weight is `1 / (position + 1)` of its first occurrence, and the
/// score is `Σ min(wa, wb) / Σ max(wa, wb)` over the union of tokens.
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    let a = weighted_tokens(a);
    let b = weighted_tokens(b);
    let (mut shared, mut total) = (0.0_f32, 0.0_f32);
    for token in a.keys().chain(b.keys()).collect::<HashSet<_>>() {
        let wa = a.get(token).copied().unwrap_or(0.0);
        let wb = b.get(token).copied().unwrap_or(0.0);
        shared += wa.min(wb);
        total += wa.max(wb);
    }
    if total == 0.0 { 0.0 } else { shared / total }
}

fn weighted_tokens(text: &str) -> HashMap<String, f32> {
    let mut weights = HashMap::new();
    for (position, token) in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .enumerate()
    {
        weights
            .entry(token.to_lowercase())
            .or_insert(1.0 / (position as f32 + 1.0));
    }
    weights
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use schemars::schema_for;
    use tavern_types::FactStatus;
    use uuid::Uuid;

    use super::*;

    fn fact(content: &str) -> Fact {
        Fact {
            id: Uuid::new_v4(),
            content: content.into(),
            source_user_id: "u1".into(),
            source_display_name: "Ada".into(),
            category: None,
            first_mentioned_at: Utc::now(),
            last_mentioned_at: Utc::now(),
            reference_count: 1,
            status: FactStatus::Active,
            superseded_by: None,
        }
    }

    #[test]
    fn identical_texts_score_one() {
        assert_eq!(lexical_similarity("Likes Green Tea", "likes green tea!"), 1.0);
    }

    #[test]
    fn disjoint_texts_score_zero() {
        assert_eq!(lexical_similarity("owns a cat", "plays chess"), 0.0);
        assert_eq!(lexical_similarity("", ""), 0.0);
    }

    #[test]
    fn shared_leading_tokens_weigh_more() {
        // shared 1 + 1/2 + 1/3, union adds 1/4 for each differing value
        let score = lexical_similarity("favorite color is blue", "favorite color is red");
        assert!((score - (11.0 / 6.0) / (14.0 / 6.0)).abs() < 1e-6);

        let same_value = lexical_similarity("owns a red bike", "wants a red car");
        assert!(score > same_value);
    }

    #[tokio::test]
    async fn changed_value_ranks_above_default_floor() {
        let floor = crate::ConsolidationConfig::default().similarity_floor;
        let oracle = LlmOracle::new("http://localhost:11434", "llama3");
        let corpus = vec![fact("favorite color is blue"), fact("plays chess")];
        let ranked = oracle.rank("favorite color is red", &corpus).await.unwrap();
        assert_eq!(ranked[0].0.content, "favorite color is blue");
        assert!(ranked[0].1 >= floor, "score {} below floor {floor}", ranked[0].1);
        assert!(ranked[1].1 < floor);
    }

    #[tokio::test]
    async fn rank_orders_corpus_by_similarity() {
        let oracle = LlmOracle::new("http://localhost:11434", "llama3");
        let corpus = vec![fact("plays chess"), fact("likes green tea"), fact("likes tea")];
        let ranked = oracle.rank("likes tea", &corpus).await.unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].0.content, "likes tea");
        assert_eq!(ranked[2].0.content, "plays chess");
    }

    #[test]
    fn extraction_schema_describes_fact_list() {
        let schema = serde_json::to_value(schema_for!(ExtractionReply)).unwrap().to_string();
        assert!(schema.contains("facts"));
        assert!(schema.contains("content"));
    }

    #[test]
    fn judge_reply_parses_lowercase_verdict() {
        let reply: JudgeReply = serde_json::from_str(r#"{"verdict":"contradicts"}"#).unwrap();
        assert_eq!(reply.verdict, Judgment::Contradicts);
    }

    #[test]
    fn bad_response_maps_to_oracle_bad_response() {
        let err: OracleError = LlmError::BadResponse("nope".into()).into();
        assert_eq!(err, OracleError::BadResponse("nope".into()));
    }
}
