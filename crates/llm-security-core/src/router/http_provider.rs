//! OpenAI-compatible provider implementation.
//!
//! [`HttpProvider`] works with any API that follows the OpenAI chat
//! completion format: OpenAI itself, Anthropic's compatibility endpoint,
//! vLLM, Ollama and most hosted inference services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::provider::{Provider, ProviderError, ProviderOutput, ProviderRequest};
use crate::types::ChatMessage;

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// A provider speaking the OpenAI chat completion protocol over HTTP.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the API key from an environment variable.
    pub fn from_env(name: impl Into<String>, base_url: impl Into<String>, api_key_env: &str) -> Self {
        let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(env = api_key_env, "provider API key not set; calls will fail until it is");
        }
        Self::new(name, base_url, api_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ProviderError> {
        match &self.api_key {
            Some(key) => Ok(req.bearer_auth(key)),
            None => Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{}'",
                self.name
            ))),
        }
    }
}

fn map_send_error(err: reqwest::Error, timeout: std::time::Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Network(err.to_string())
    }
}

fn map_status(response: &reqwest::Response, model: &str) -> Option<ProviderError> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_ms(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            ),
        },
        401 | 403 => ProviderError::AuthFailed,
        404 => ProviderError::ModelNotFound(model.to_string()),
        s if s >= 500 => ProviderError::Server { status: s },
        s => ProviderError::InvalidResponse(format!("unexpected HTTP {s}")),
    })
}

/// `Retry-After` in whole seconds, as milliseconds. Defaults to one second.
fn retry_after_ms(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(1_000, |secs| secs.saturating_mul(1_000))
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        debug!(
            provider = %self.name,
            model = %request.model,
            request_id = %request.request_id,
            "sending chat completion request"
        );

        let req = self
            .authorized(self.http.post(self.url("chat/completions")))?
            .header("x-request-id", &request.request_id)
            .timeout(request.timeout)
            .json(&body);

        let response = req
            .send()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;
        if let Some(err) = map_status(&response, &request.model) {
            warn!(provider = %self.name, status = response.status().as_u16(), "provider returned error status");
            return Err(err);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;
        let usage = parsed.usage.unwrap_or(WireUsage {
            prompt_tokens: crate::types::estimate_tokens(&request.payload),
            completion_tokens: crate::types::estimate_tokens(&text),
        });

        Ok(ProviderOutput {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let timeout = std::time::Duration::from_secs(5);
        let response = self
            .authorized(self.http.get(self.url("models")))?
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;
        match map_status(&response, "") {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
