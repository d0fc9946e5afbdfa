//! Gateway error types for LLM-Security-Core.
//!
//! Every rejection surfaces as a [`GatewayError`] carrying a stable
//! [`ErrorCode`]. Clients only ever see the code and
//! [`GatewayError::client_message`]; internal variants collapse to a generic
//! message so policy internals never leak.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::QuotaDimension;

/// Why a credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialFailure {
    Missing,
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    Revoked,
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialFailure::Missing => "missing",
            CredentialFailure::Malformed => "malformed",
            CredentialFailure::BadSignature => "bad_signature",
            CredentialFailure::Expired => "expired",
            CredentialFailure::NotYetValid => "not_yet_valid",
            CredentialFailure::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the LLM-Security-Core gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Credential missing, malformed, badly signed, expired or revoked.
    #[error("Invalid credential ({kind}): {detail}")]
    InvalidCredential {
        kind: CredentialFailure,
        detail: String,
    },

    /// A quota dimension could not admit the request.
    #[error("Quota exceeded for {dimension}, retry after {retry_after:?}")]
    QuotaExceeded {
        dimension: QuotaDimension,
        retry_after: Duration,
    },

    /// Operation denied by the policy authorizer.
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// Content safety score crossed the block threshold.
    #[error("Content policy violation (risk score {score:.2})")]
    ContentPolicyViolation { score: f64, rules: Vec<String> },

    /// The overall deadline expired while waiting on a provider.
    #[error("Provider timeout: {0}")]
    ProviderTimeout(String),

    /// Every candidate in the fallback chain failed or was open.
    #[error("All providers unavailable: {0}")]
    AllProvidersUnavailable(String),

    /// Rule data could not be parsed or validated.
    #[error("Policy evaluation error: {0}")]
    PolicyEvaluation(String),

    /// A stage tried to write to an audit trail that was already flushed.
    #[error("Audit record already finalized for request {0}")]
    AlreadyFinalized(String),

    /// The caller went away or the request deadline expired.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Anything unexpected.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured error code exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredential,
    QuotaExceeded,
    PolicyDenied,
    ContentPolicyViolation,
    ProviderTimeout,
    AllProvidersUnavailable,
    PolicyEvaluationError,
    AlreadyFinalized,
    Cancelled,
    Internal,
}

impl ErrorCode {
    /// Stable string form, identical to the serialized value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredential => "INVALID_CREDENTIAL",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::PolicyDenied => "POLICY_DENIED",
            ErrorCode::ContentPolicyViolation => "CONTENT_POLICY_VIOLATION",
            ErrorCode::ProviderTimeout => "PROVIDER_TIMEOUT",
            ErrorCode::AllProvidersUnavailable => "ALL_PROVIDERS_UNAVAILABLE",
            ErrorCode::PolicyEvaluationError => "POLICY_EVALUATION_ERROR",
            ErrorCode::AlreadyFinalized => "ALREADY_FINALIZED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether a client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::QuotaExceeded
                | ErrorCode::ProviderTimeout
                | ErrorCode::AllProvidersUnavailable
        )
    }

    /// Internal invariant violations, logged as operational errors.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ErrorCode::PolicyEvaluationError | ErrorCode::AlreadyFinalized | ErrorCode::Internal
        )
    }

    /// HTTP status the API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidCredential => 401,
            ErrorCode::QuotaExceeded => 429,
            ErrorCode::PolicyDenied => 403,
            ErrorCode::ContentPolicyViolation => 422,
            ErrorCode::ProviderTimeout => 504,
            ErrorCode::AllProvidersUnavailable => 503,
            ErrorCode::Cancelled => 499,
            ErrorCode::PolicyEvaluationError | ErrorCode::AlreadyFinalized | ErrorCode::Internal => {
                500
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    pub fn invalid_credential(kind: CredentialFailure, detail: impl Into<String>) -> Self {
        GatewayError::InvalidCredential {
            kind,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidCredential { .. } => ErrorCode::InvalidCredential,
            GatewayError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            GatewayError::PolicyDenied(_) => ErrorCode::PolicyDenied,
            GatewayError::ContentPolicyViolation { .. } => ErrorCode::ContentPolicyViolation,
            GatewayError::ProviderTimeout(_) => ErrorCode::ProviderTimeout,
            GatewayError::AllProvidersUnavailable(_) => ErrorCode::AllProvidersUnavailable,
            GatewayError::PolicyEvaluation(_) => ErrorCode::PolicyEvaluationError,
            GatewayError::AlreadyFinalized(_) => ErrorCode::AlreadyFinalized,
            GatewayError::Cancelled(_) => ErrorCode::Cancelled,
            GatewayError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wait hint for retryable rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Non-sensitive reason string safe to return to the caller.
    ///
    /// Never includes redaction details, rule ids, provider names or
    /// credential internals.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::InvalidCredential { kind, .. } => {
                format!("credential rejected ({kind}); re-authenticate and retry")
            }
            GatewayError::QuotaExceeded {
                dimension,
                retry_after,
            } => format!(
                "{dimension} quota exhausted; retry after {}s",
                retry_after.as_secs_f64().ceil() as u64
            ),
            GatewayError::PolicyDenied(_) => {
                "the requested model or action is not permitted for this principal".to_string()
            }
            GatewayError::ContentPolicyViolation { .. } => {
                "the request content violates the content policy; rephrase and retry".to_string()
            }
            GatewayError::ProviderTimeout(_) => {
                "the model backend did not answer in time".to_string()
            }
            GatewayError::AllProvidersUnavailable(_) => {
                "no model backend is currently available".to_string()
            }
            GatewayError::Cancelled(_) => "the request was cancelled".to_string(),
            GatewayError::PolicyEvaluation(_)
            | GatewayError::AlreadyFinalized(_)
            | GatewayError::Internal(_) => "internal gateway error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::QuotaExceeded.is_retryable());
        assert!(ErrorCode::AllProvidersUnavailable.is_retryable());
        assert!(ErrorCode::ProviderTimeout.is_retryable());
        assert!(!ErrorCode::PolicyDenied.is_retryable());
        assert!(!ErrorCode::ContentPolicyViolation.is_retryable());
        assert!(!ErrorCode::InvalidCredential.is_retryable());
    }

    #[test]
    fn internal_errors_are_not_exposed_verbatim() {
        let err = GatewayError::PolicyEvaluation("rule r7 has bad wildcard".into());
        assert_eq!(err.code(), ErrorCode::PolicyEvaluationError);
        assert!(err.code().is_internal());
        assert!(!err.client_message().contains("r7"));
    }

    #[test]
    fn policy_denial_hides_reason() {
        let err = GatewayError::PolicyDenied("deny rule 'no-gpt4-free' matched".into());
        assert!(!err.client_message().contains("no-gpt4-free"));
        assert_eq!(err.code().http_status(), 403);
    }

    #[test]
    fn quota_message_has_retry_after() {
        let err = GatewayError::QuotaExceeded {
            dimension: QuotaDimension::Requests,
            retry_after: Duration::from_millis(5_500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(5_500)));
        assert!(err.client_message().contains("retry after 6s"));
        assert_eq!(err.code().as_str(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::AllProvidersUnavailable).unwrap();
        assert_eq!(json, "\"ALL_PROVIDERS_UNAVAILABLE\"");
    }
}
