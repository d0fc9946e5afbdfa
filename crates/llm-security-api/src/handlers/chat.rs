//! POST /v1/chat/completions

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap},
    Extension, Json,
};
use llm_security_core::{ChatMessage, GatewayResponse, InboundRequest};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestId;
use crate::state::AppState;

const DEFAULT_MAX_TOKENS: u32 = 256;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Forwarded to the backend; its own default applies when absent.
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ChatCompletionRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.model.trim().is_empty() {
            return Err(ApiError::BadRequest("model must not be empty".into()));
        }
        if self.messages.is_empty() {
            return Err(ApiError::BadRequest("messages must not be empty".into()));
        }
        if self.max_tokens == Some(0) {
            return Err(ApiError::BadRequest("max_tokens must be positive".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ApiError::BadRequest("temperature must be between 0 and 2".into()));
            }
        }
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Run one chat request through the gateway pipeline.
///
/// The `x-request-id` value is only a correlation id; the gateway assigns
/// the request id. A client disconnect drops this future, which seals the
/// request's audit record as cancelled.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ApiResult<Json<GatewayResponse>> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    body.validate()?;

    let inbound = InboundRequest {
        credential: bearer_token(&headers),
        target_model: body.model,
        messages: body.messages,
        max_output_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body.temperature,
        action: "chat".to_string(),
        metadata: body.metadata,
        correlation_id: Some(request_id.0),
    };

    let response = state.gateway.process(inbound).await?;
    Ok(Json(response))
}
