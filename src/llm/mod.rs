//! LLM inference providers.
//!
//! A provider turns a prompt plus a JSON schema hint into a structured JSON
//! value. Providers are looked up by type tag in a [`ProviderRegistry`].

pub mod anthropic;
pub mod openai;
pub mod retry;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Upper bound on a provider-supplied `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Errors a provider call can end in.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("authentication failed: {0}")]
    AuthError(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Timeout | ProviderError::Unavailable(_)
        )
    }

    /// Short tag used on the job error log.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout => "timeout",
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::AuthError(_) => "auth_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown LLM provider '{0}'")]
    UnknownProvider(String),

    #[error("environment variable {0} holding the API key is not set")]
    MissingApiKey(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Complete `prompt`, returning the JSON object the model produced.
    async fn complete(&self, prompt: &Prompt, schema_hint: &Value) -> Result<Value, ProviderError>;
}

/// `[llm]` section of the engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider tag (`openai`, `anthropic`). Unset disables the semantic detector.
    pub provider: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "SIGNALSIFT_LLM_API_KEY".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            request_timeout_secs: 60,
        }
    }
}

type Factory = fn(&LlmConfig, String) -> Result<Arc<dyn LlmProvider>, RegistryError>;

/// Provider constructors keyed by type tag.
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(openai::TAG, |cfg, key| {
            let provider: Arc<dyn LlmProvider> = Arc::new(openai::OpenAiProvider::from_config(cfg, key)?);
            Ok(provider)
        });
        registry.register(anthropic::TAG, |cfg, key| {
            let provider: Arc<dyn LlmProvider> = Arc::new(anthropic::AnthropicProvider::from_config(cfg, key)?);
            Ok(provider)
        });
        registry
    }

    pub fn register(&mut self, tag: &'static str, factory: Factory) {
        self.factories.insert(tag, factory);
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().copied()
    }

    /// Build the configured provider. `Ok(None)` when no provider is configured.
    pub fn build(&self, config: &LlmConfig) -> Result<Option<Arc<dyn LlmProvider>>, RegistryError> {
        let Some(tag) = config.provider.as_deref() else {
            return Ok(None);
        };
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownProvider(tag.to_string()))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RegistryError::MissingApiKey(config.api_key_env.clone()))?;
        let provider = factory(config, api_key)?;
        info!(provider = tag, model = %config.model, "LLM provider ready");
        Ok(Some(provider))
    }
}

pub(crate) fn http_client(config: &LlmConfig) -> Result<reqwest::Client, RegistryError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
        .build()
        .map_err(|e| RegistryError::Client(e.to_string()))
}

pub(crate) fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_decode() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn status_error(status: StatusCode, retry_after: Option<&str>, body: &str) -> ProviderError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .and_then(|s| Duration::try_from_secs_f64(s.min(MAX_RETRY_AFTER.as_secs_f64())).ok()),
        },
        401 | 403 => ProviderError::AuthError(detail),
        408 => ProviderError::Timeout,
        s if s >= 500 => ProviderError::Unavailable(detail),
        _ => ProviderError::InvalidResponse(detail),
    }
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, retry_after.as_deref(), &body))
}

/// Parse the JSON object embedded in a model's text output.
pub(crate) fn parse_json_content(text: &str) -> Result<Value, ProviderError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let slice = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(ProviderError::InvalidResponse(format!(
                "no JSON object in model output: {}",
                truncate(text, 120)
            )))
        }
    };
    serde_json::from_str(slice).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some("2"), ""),
            ProviderError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, "bad key"),
            ProviderError::AuthError(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, ""),
            ProviderError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_retry_after_out_of_range() {
        for raw in ["1e20", "inf", "-5", "NaN", "soon"] {
            match status_error(StatusCode::TOO_MANY_REQUESTS, Some(raw), "") {
                ProviderError::RateLimited { retry_after } => {
                    assert!(retry_after.map_or(true, |d| d <= MAX_RETRY_AFTER), "{}", raw);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some("1e20"), ""),
            ProviderError::RateLimited { retry_after: Some(d) } if d == MAX_RETRY_AFTER
        ));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Unavailable("x".into()).is_retryable());
        assert!(!ProviderError::AuthError("x".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_parse_json_content() {
        let v = parse_json_content("Sure:\n```json\n{\"anomalies\": []}\n```").unwrap();
        assert!(v["anomalies"].as_array().unwrap().is_empty());
        assert!(parse_json_content("no json here").is_err());
    }

    #[test]
    fn test_registry_without_provider() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.build(&LlmConfig::default()).unwrap().is_none());
        let tags: Vec<&str> = registry.tags().collect();
        assert_eq!(tags, vec!["anthropic", "openai"]);
    }

    #[test]
    fn test_registry_rejects_unknown_or_keyless() {
        let registry = ProviderRegistry::with_defaults();
        let unknown = LlmConfig {
            provider: Some("oracle".into()),
            ..LlmConfig::default()
        };
        assert!(matches!(registry.build(&unknown), Err(RegistryError::UnknownProvider(_))));

        let keyless = LlmConfig {
            provider: Some("openai".into()),
            api_key_env: "SIGNALSIFT_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..LlmConfig::default()
        };
        assert!(matches!(registry.build(&keyless), Err(RegistryError::MissingApiKey(_))));
    }
}
