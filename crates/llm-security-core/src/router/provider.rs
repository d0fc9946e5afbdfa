//! The [`Provider`] trait every model backend implements.
//!
//! The router only sees this interface, so an OpenAI-compatible HTTP API,
//! a local model server and a test double are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::ChatMessage;

/// Errors that can occur when calling a model backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The request could not be sent or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with a 5xx status.
    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    /// Authentication with the provider was rejected (HTTP 401/403).
    #[error("authentication failed")]
    AuthFailed,

    /// The provider returned a rate-limit response (HTTP 429).
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The requested model does not exist on the provider.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The provider has not been configured (e.g. missing API key).
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The provider returned a response that could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The per-provider timeout elapsed.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Transient failures worth another attempt on the same backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Server { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout(_)
        )
    }

    /// Whether this failure says something about the backend's health.
    /// Caller-side problems (bad key, unknown model) do not trip breakers.
    pub fn counts_against_health(&self) -> bool {
        !matches!(
            self,
            ProviderError::AuthFailed | ProviderError::ModelNotFound(_) | ProviderError::NotConfigured(_)
        )
    }

    /// Low-cardinality label for metrics and audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Network(_) => "network",
            ProviderError::Server { .. } => "server_error",
            ProviderError::AuthFailed => "auth_failed",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::ModelNotFound(_) => "model_not_found",
            ProviderError::NotConfigured(_) => "not_configured",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Timeout(_) => "timeout",
        }
    }
}

/// What the router asks a backend to do.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub request_id: String,
    pub model: String,
    /// Redacted message contents joined into one prompt.
    pub payload: String,
    /// Redacted messages with their original roles.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Budget for this single attempt.
    pub timeout: Duration,
}

/// Text and token usage returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A backend that can generate a completion.
///
/// Implementations should honour `request.timeout`; the router enforces it
/// as well, so a backend that ignores it is cut off rather than waited on.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g. "openai", "anthropic", "local").
    fn name(&self) -> &str;

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError>;

    /// Cheap liveness probe used by the periodic health check.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Offline backend that answers with a digest of the prompt.
///
/// Used for local development and smoke tests where no model API is
/// reachable. Usage is estimated at one token per four characters.
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        let text = format!("[{}] received: {}", request.model, request.payload);
        let completion: String = text.chars().take(request.max_tokens as usize * 4).collect();
        Ok(ProviderOutput {
            prompt_tokens: crate::types::estimate_tokens(&request.payload),
            completion_tokens: crate::types::estimate_tokens(&completion),
            text: completion,
        })
    }
}
