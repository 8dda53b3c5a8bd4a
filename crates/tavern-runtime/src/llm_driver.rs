//! [`LlmDriver`] – OpenAI-compatible LLM interface.
//!
//! Communicates with a model server that exposes an OpenAI-compatible
//! `/v1/chat/completions` endpoint, such as [Ollama](https://ollama.com)
//! (`http://localhost:11434`).  Replies are constrained to a JSON Schema
//! derived with `schemars` from the Rust type the caller expects back.
//!
//! # Example
//!
//! ```rust,no_run
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use tavern_runtime::llm_driver::{ChatMessage, LlmDriver, Role};
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Answer {
//!     yes: bool,
//! }
//!
//! # async fn demo() -> Result<(), tavern_runtime::llm_driver::LlmError> {
//! let driver = LlmDriver::new("http://localhost:11434", "llama3");
//! let messages = vec![
//!     ChatMessage { role: Role::System, content: "Answer the question.".into() },
//!     ChatMessage { role: Role::User, content: "Is water wet?".into() },
//! ];
//! let answer: Answer = driver.complete_json(&messages).await?;
//! # Ok(())
//! # }
//! ```

use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

// ─────────────────────────────────────────────────────────────────────────────
// Grounding rules
// ─────────────────────────────────────────────────────────────────────────────

/// Rules appended to every system-role message.  They keep the model from
/// inventing facts that the conversation does not support.
pub const GROUNDING_RULES: &str = "\
## Grounding rules
- Only use information stated in the supplied messages.
- Never guess or embellish; omit anything uncertain.
- Reply with JSON matching the requested schema and nothing else.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<Zeroizing<String>>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a new driver pointing at `base_url` (e.g. `"http://localhost:11434"`)
    /// and using `model` (e.g. `"llama3"`).
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Zeroizing::new(key.into()));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send `messages` and return the assistant's reply text.
    ///
    /// [`GROUNDING_RULES`] are appended to every [`Role::System`] message, or
    /// sent as the only system message when the caller supplied none.  When
    /// `schema` is given it is passed as a `json_schema` response format.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        let augmented = with_grounding_rules(messages);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: &augmented,
            stream: false,
            response_format: schema.map(|json_schema| ResponseFormat {
                kind: "json_schema",
                json_schema,
            }),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }
        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// Like [`complete`][Self::complete], constraining the reply to `T`'s
    /// JSON Schema and parsing it.
    pub async fn complete_json<T>(&self, messages: &[ChatMessage]) -> Result<T, LlmError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = serde_json::to_value(schema_for!(T))
            .map_err(|e| LlmError::BadResponse(format!("schema generation failed: {e}")))?;
        let reply = self.complete(messages, Some(schema)).await?;
        parse_json_reply(&reply)
    }
}

fn with_grounding_rules(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut augmented: Vec<ChatMessage> = messages
        .iter()
        .map(|m| {
            if m.role == Role::System {
                ChatMessage {
                    role: Role::System,
                    content: format!("{}\n\n{}", m.content, GROUNDING_RULES),
                }
            } else {
                m.clone()
            }
        })
        .collect();

    if !augmented.iter().any(|m| m.role == Role::System) {
        augmented.insert(
            0,
            ChatMessage {
                role: Role::System,
                content: GROUNDING_RULES.to_string(),
            },
        );
    }
    augmented
}

/// Parse a model reply, tolerating a surrounding Markdown code fence.
fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T, LlmError> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| LlmError::BadResponse(format!("{e}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Probe {
        value: u32,
    }

    #[test]
    fn chat_message_serializes_role() {
        let msg = ChatMessage {
            role: Role::System,
            content: "hello".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn grounding_rules_are_appended_to_system_message() {
        let messages = vec![ChatMessage {
            role: Role::System,
            content: "Extract facts.".into(),
        }];
        let augmented = with_grounding_rules(&messages);
        assert_eq!(augmented.len(), 1);
        assert!(augmented[0].content.starts_with("Extract facts."));
        assert!(augmented[0].content.contains("Grounding rules"));
    }

    #[test]
    fn grounding_rules_prepended_when_no_system_message() {
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "hi".into(),
        }];
        let augmented = with_grounding_rules(&messages);
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[0].role, Role::System);
        assert_eq!(augmented[1].content, "hi");
    }

    #[test]
    fn request_omits_response_format_without_schema() {
        let body = ChatRequest {
            model: "llama3",
            messages: &[],
            stream: false,
            response_format: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn parse_json_reply_accepts_plain_and_fenced_json() {
        assert_eq!(parse_json_reply::<Probe>("{\"value\": 3}").unwrap(), Probe { value: 3 });
        assert_eq!(
            parse_json_reply::<Probe>("```json\n{\"value\": 4}\n```").unwrap(),
            Probe { value: 4 }
        );
    }

    #[test]
    fn parse_json_reply_rejects_prose() {
        assert!(matches!(
            parse_json_reply::<Probe>("I think the value is 3"),
            Err(LlmError::BadResponse(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed_from_base_url() {
        let driver = LlmDriver::new("http://localhost:11434/", "llama3");
        assert_eq!(driver.base_url, "http://localhost:11434");
        assert_eq!(driver.model(), "llama3");
    }
}
