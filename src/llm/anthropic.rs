//! Anthropic messages API client.

use super::{check_status, http_client, map_transport, parse_json_content, LlmConfig, LlmProvider, Prompt, ProviderError, RegistryError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

pub const TAG: &str = "anthropic";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn from_config(config: &LlmConfig, api_key: String) -> Result<Self, RegistryError> {
        Ok(Self {
            client: http_client(config)?,
            api_key,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        TAG
    }

    async fn complete(&self, prompt: &Prompt, schema_hint: &Value) -> Result<Value, ProviderError> {
        let request = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": format!(
                "{}\nRespond only with a JSON object matching this schema:\n{}",
                prompt.system, schema_hint
            ),
            "messages": [{ "role": "user", "content": prompt.user }],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(map_transport)?;
        let body: Value = check_status(response).await?.json().await.map_err(map_transport)?;

        let text = body
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("no text block in message".to_string()))?;
        debug!(model = %self.model, chars = text.len(), "message received");
        parse_json_content(text)
    }
}
