//! `tavern-runtime` – consolidation and inference plumbing.
//!
//! # Modules
//!
//! - [`consolidation`] – [`ConsolidationPipeline`][consolidation::ConsolidationPipeline]:
//!   the per-tenant single-flight run that turns the short-term log into
//!   long-term facts, archives it, and truncates it.  Exposes the
//!   `on_message_appended` / `request_consolidation` trigger surface.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible chat-completions client with JSON-Schema constrained
//!   replies.
//! - [`llm_oracle`] – [`LlmOracle`][llm_oracle::LlmOracle]: implements both
//!   oracle traits on top of the driver.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod consolidation;
pub mod llm_driver;
pub mod llm_oracle;
pub mod telemetry;

pub use consolidation::{ConsolidationConfig, ConsolidationPipeline, TriggerOutcome};
