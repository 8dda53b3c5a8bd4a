//! Model-server discovery.
//!
//! Lists the models served by an OpenAI-compatible `/v1/models` endpoint so
//! the operator can confirm the configured model exists before the first
//! consolidation run needs it.

use serde::Deserialize;

use crate::config::ApiKey;

#[derive(Debug, Clone, Deserialize)]
pub struct ServedModel {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ServedModel>,
}

/// Fetch the served models.  Blocking; call outside the Tokio runtime.
pub fn fetch_models(base_url: &str, api_key: &ApiKey) -> Result<Vec<ServedModel>, String> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::new();
    let mut request = client.get(&url);
    if !api_key.is_empty() {
        request = request.bearer_auth(api_key.expose());
    }
    let response = request
        .send()
        .map_err(|e| format!("model server unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("model server returned HTTP {}", response.status()));
    }

    let list: ModelList = response
        .json()
        .map_err(|e| format!("Failed to parse model list: {}", e))?;
    Ok(list.data)
}

/// Whether `model` appears in `served`, ignoring an Ollama `:latest` tag.
pub fn is_served(served: &[ServedModel], model: &str) -> bool {
    served
        .iter()
        .any(|m| m.id == model || m.id.strip_suffix(":latest") == Some(model))
}
