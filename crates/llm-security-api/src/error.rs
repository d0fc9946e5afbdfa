//! HTTP mapping of gateway errors.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use llm_security_core::{ErrorCode, GatewayError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Malformed request body or missing fields.
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Gateway(e) => StatusCode::from_u16(e.code().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Gateway(err) => {
                let code = err.code();
                if code.is_internal() {
                    tracing::error!(code = %code, error = %err, "internal gateway error");
                }
                let mut error = json!({
                    "code": code.as_str(),
                    "message": err.client_message(),
                    "retryable": code.is_retryable(),
                });
                if let Some(wait) = err.retry_after() {
                    error["retry_after_seconds"] = json!(wait.as_secs_f64().ceil() as u64);
                }
                json!({ "error": error })
            }
            ApiError::BadRequest(msg) => json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": msg,
                    "retryable": false,
                }
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::Gateway(err) = &self {
            if err.code() == ErrorCode::QuotaExceeded {
                if let Some(wait) = err.retry_after() {
                    let secs = (wait.as_secs_f64().ceil() as u64).to_string();
                    if let Ok(value) = HeaderValue::from_str(&secs) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use llm_security_core::QuotaDimension;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn quota_error_carries_retry_after() {
        let err = ApiError::from(GatewayError::QuotaExceeded {
            dimension: QuotaDimension::Tokens,
            retry_after: Duration::from_millis(1_500),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["error"]["retryable"], true);
        assert_eq!(body["error"]["retry_after_seconds"], 2);
    }

    #[tokio::test]
    async fn internal_errors_are_opaque() {
        let err = ApiError::from(GatewayError::PolicyEvaluation("rule 'x' has bad regex".into()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "POLICY_EVALUATION_ERROR");
        assert_eq!(body["error"]["message"], "internal gateway error");
    }

    #[tokio::test]
    async fn cancelled_maps_to_499() {
        let response = ApiError::from(GatewayError::Cancelled("gone".into())).into_response();
        assert_eq!(response.status().as_u16(), 499);
    }
}
