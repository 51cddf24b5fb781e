use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{Decoding, GenerationError, SYSTEM_PROMPT, check_status, user_prompt};

pub const DEFAULT_LOCAL_URL: &str = "http://localhost:11434";

/// Installed models are matched against these, in order, when no model is
/// configured explicitly.
pub const PREFERRED_LOCAL_MODELS: &[&str] = &["meditron", "llama3.1", "llama3", "mistral"];

const DEFAULT_NUM_PREDICT: u32 = 512;

/// Client for an Ollama-compatible local server.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
    decoding: Decoding,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl LocalBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        model: Option<String>,
        decoding: Decoding,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.filter(|m| !m.trim().is_empty()),
            decoding,
        }
    }

    /// List installed models and pick one.
    pub async fn probe(&self, timeout: Duration) -> Result<String, GenerationError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(timeout)
            .send()
            .await?;
        check_status(response.status())?;

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("malformed model list: {e}")))?;
        let installed: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();

        choose_model(self.model.as_deref(), &installed)
            .ok_or_else(|| GenerationError::Unavailable("no models installed".to_string()))
    }

    pub async fn generate(
        &self,
        model: &str,
        question: &str,
        context: &str,
    ) -> Result<String, GenerationError> {
        let body = json!({
            "model": model,
            "system": SYSTEM_PROMPT,
            "prompt": user_prompt(question, context),
            "stream": false,
            "options": {
                "temperature": self.decoding.temperature,
                "top_p": self.decoding.top_p,
                "num_predict": self.decoding.max_tokens.unwrap_or(DEFAULT_NUM_PREDICT),
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;
        check_status(response.status())?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("malformed response: {e}")))?;
        if parsed.response.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(parsed.response)
    }
}

/// The configured model when installed, else the first installed model
/// matching [`PREFERRED_LOCAL_MODELS`], else the first installed model.
///
/// A configured name matches an installed model exactly or by its name
/// without the `:tag` suffix.
fn choose_model(configured: Option<&str>, installed: &[String]) -> Option<String> {
    if let Some(wanted) = configured {
        let found = installed
            .iter()
            .find(|name| *name == wanted || name.split(':').next() == Some(wanted));
        if let Some(name) = found {
            return Some(name.clone());
        }
        tracing::warn!(model = wanted, "configured local model is not installed");
    }

    for preferred in PREFERRED_LOCAL_MODELS {
        if let Some(name) = installed
            .iter()
            .find(|name| name.to_lowercase().contains(preferred))
        {
            return Some(name.clone());
        }
    }

    installed.first().cloned()
}
