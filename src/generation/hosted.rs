use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{Decoding, GenerationError, SYSTEM_PROMPT, check_status, user_prompt};

pub const DEFAULT_HOSTED_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_HOSTED_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct HostedBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    decoding: Decoding,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

impl HostedBackend {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        decoding: Decoding,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            decoding,
        }
    }

    fn api_key(&self) -> Result<&str, GenerationError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Unavailable("no API key configured".to_string()))
    }

    /// Check that the API is reachable and the key is accepted.
    ///
    /// Returns the configured model name. Without an API key this fails
    /// immediately, without touching the network.
    pub async fn probe(&self, timeout: Duration) -> Result<String, GenerationError> {
        let key = self.api_key()?;
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key)
            .timeout(timeout)
            .send()
            .await?;
        check_status(response.status())?;
        Ok(self.model.clone())
    }

    pub async fn generate(
        &self,
        model: &str,
        question: &str,
        context: &str,
    ) -> Result<String, GenerationError> {
        let key = self.api_key()?;
        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(question, context) },
            ],
            "temperature": self.decoding.temperature,
            "top_p": self.decoding.top_p,
            "max_tokens": self.decoding.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        check_status(response.status())?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)
    }
}
