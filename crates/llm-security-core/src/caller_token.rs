//! CallerToken creation and validation using HMAC-SHA256.
//!
//! Wire form: `base64url(claims-json) "." hex(hmac-sha256(payload))`.
//! The claims carry everything the gateway needs to build a [`Principal`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{CredentialFailure, GatewayError};
use crate::types::{Principal, Tier};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TTL_SECONDS: i64 = 300; // 5 minutes
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 30;

/// Signed claims of a caller token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Unique token id, used for revocation.
    pub token_id: String,
    /// Principal id (e.g. "user-123", "billing-service").
    pub caller_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub tier: Tier,
    /// Token creation timestamp (RFC 3339).
    pub issued_at: String,
}

/// HMAC-signed caller identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerToken {
    pub claims: TokenClaims,
    /// HMAC-SHA256 of the encoded claims (hex).
    pub signature: String,
}

impl CallerToken {
    /// Create a new signed CallerToken for `principal`.
    pub fn create(principal: &Principal, shared_secret: &str) -> Result<Self, GatewayError> {
        Self::create_at(principal, shared_secret, Utc::now())
    }

    pub fn create_at(
        principal: &Principal,
        shared_secret: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, GatewayError> {
        if principal.id.is_empty() {
            return Err(malformed("caller_id must not be empty"));
        }
        if principal.tenant_id.is_empty() {
            return Err(malformed("tenant_id must not be empty"));
        }
        if shared_secret.is_empty() {
            return Err(malformed("shared_secret must not be empty"));
        }

        let claims = TokenClaims {
            token_id: Uuid::new_v4().to_string(),
            caller_id: principal.id.clone(),
            tenant_id: principal.tenant_id.clone(),
            roles: principal.roles.iter().cloned().collect(),
            tier: principal.tier,
            issued_at: issued_at.to_rfc3339(),
        };
        let payload = encode_claims(&claims)?;
        let signature = compute_signature(&payload, shared_secret)?;

        Ok(Self { claims, signature })
    }

    /// Serialize to the bearer wire form.
    pub fn encode(&self) -> Result<String, GatewayError> {
        Ok(format!("{}.{}", encode_claims(&self.claims)?, self.signature))
    }

    /// Parse the bearer wire form. Does not verify the signature.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GatewayError::invalid_credential(
                CredentialFailure::Missing,
                "credential is empty",
            ));
        }
        let (payload, signature) = raw
            .split_once('.')
            .ok_or_else(|| malformed("expected <payload>.<signature>"))?;
        if payload.is_empty() || signature.is_empty() {
            return Err(malformed("payload or signature segment is empty"));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| malformed("payload is not valid base64url"))?;
        let claims: TokenClaims =
            serde_json::from_slice(&bytes).map_err(|_| malformed("payload is not valid claims"))?;

        // Only the canonical encoding is accepted, so the signature always
        // covers exactly what `encode_claims` produces.
        if encode_claims(&claims)? != payload {
            return Err(malformed("payload is not canonically encoded"));
        }

        Ok(Self {
            claims,
            signature: signature.to_string(),
        })
    }

    /// Validate this token's signature and expiry.
    ///
    /// # Arguments
    ///
    /// * `shared_secret` - Shared secret for HMAC verification
    /// * `ttl_seconds` - Maximum token age in seconds (None = use default 300s)
    pub fn validate(&self, shared_secret: &str, ttl_seconds: Option<i64>) -> Result<(), GatewayError> {
        self.validate_at(shared_secret, ttl_seconds, Utc::now())
    }

    pub fn validate_at(
        &self,
        shared_secret: &str,
        ttl_seconds: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let ttl = ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);

        if self.claims.caller_id.is_empty() {
            return Err(malformed("caller_id is empty"));
        }
        if self.claims.tenant_id.is_empty() {
            return Err(malformed("tenant_id is empty"));
        }
        if self.signature.is_empty() {
            return Err(malformed("signature is empty"));
        }

        // Constant-time comparison via HMAC verify
        let payload = encode_claims(&self.claims)?;
        let mut mac = HmacSha256::new_from_slice(shared_secret.as_bytes())
            .map_err(|e| malformed(format!("HMAC error: {}", e)))?;
        mac.update(payload.as_bytes());

        let sig_bytes = hex::decode(&self.signature).map_err(|_| {
            GatewayError::invalid_credential(
                CredentialFailure::BadSignature,
                "signature is not valid hex",
            )
        })?;
        mac.verify_slice(&sig_bytes).map_err(|_| {
            GatewayError::invalid_credential(CredentialFailure::BadSignature, "signature mismatch")
        })?;

        let issued_at: DateTime<Utc> = self
            .claims
            .issued_at
            .parse()
            .map_err(|_| malformed("invalid issued_at timestamp"))?;
        let age = now.signed_duration_since(issued_at).num_seconds();

        if age > ttl {
            return Err(GatewayError::invalid_credential(
                CredentialFailure::Expired,
                format!("age: {}s, TTL: {}s", age, ttl),
            ));
        }
        if age < -MAX_CLOCK_SKEW_SECONDS {
            return Err(GatewayError::invalid_credential(
                CredentialFailure::NotYetValid,
                "issued_at is in the future",
            ));
        }

        Ok(())
    }

    /// The principal described by the claims.
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.claims.caller_id.clone(),
            tenant_id: self.claims.tenant_id.clone(),
            roles: self.claims.roles.iter().cloned().collect(),
            tier: self.claims.tier,
        }
    }
}

fn malformed(detail: impl Into<String>) -> GatewayError {
    GatewayError::invalid_credential(CredentialFailure::Malformed, detail)
}

fn encode_claims(claims: &TokenClaims) -> Result<String, GatewayError> {
    let json = serde_json::to_vec(claims).map_err(|e| malformed(format!("claims: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Compute HMAC-SHA256 signature, returning hex-encoded string.
fn compute_signature(payload: &str, secret: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| malformed(format!("HMAC error: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal::new("user-1", "tenant-a", Tier::Premium).with_role("analyst")
    }

    fn kind(err: GatewayError) -> CredentialFailure {
        match err {
            GatewayError::InvalidCredential { kind, .. } => kind,
            other => panic!("expected InvalidCredential, got {other:?}"),
        }
    }

    #[test]
    fn test_create_encode_parse_validate() {
        let token = CallerToken::create(&principal(), "my-secret-key").unwrap();
        let wire = token.encode().unwrap();

        let parsed = CallerToken::parse(&wire).unwrap();
        assert_eq!(parsed, token);
        parsed.validate("my-secret-key", None).unwrap();

        let p = parsed.principal();
        assert_eq!(p.id, "user-1");
        assert_eq!(p.tenant_id, "tenant-a");
        assert_eq!(p.tier, Tier::Premium);
        assert!(p.has_role("analyst"));
    }

    #[test]
    fn test_wrong_secret() {
        let token = CallerToken::create(&principal(), "my-secret-key").unwrap();
        let err = token.validate("wrong-secret", None).unwrap_err();
        assert_eq!(kind(err), CredentialFailure::BadSignature);
    }

    #[test]
    fn test_tampered_claims_fail_signature() {
        let mut token = CallerToken::create(&principal(), "my-secret-key").unwrap();
        token.claims.tier = Tier::Enterprise;
        let err = token.validate("my-secret-key", None).unwrap_err();
        assert_eq!(kind(err), CredentialFailure::BadSignature);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(kind(CallerToken::parse("no-dot-here").unwrap_err()), CredentialFailure::Malformed);
        assert_eq!(kind(CallerToken::parse("!!!.abcd").unwrap_err()), CredentialFailure::Malformed);
        assert_eq!(kind(CallerToken::parse("   ").unwrap_err()), CredentialFailure::Missing);
    }

    #[test]
    fn test_non_hex_signature() {
        let mut token = CallerToken::create(&principal(), "s").unwrap();
        token.signature = "zz".repeat(32);
        assert_eq!(kind(token.validate("s", None).unwrap_err()), CredentialFailure::BadSignature);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(CallerToken::create(&Principal::new("", "t", Tier::Free), "s").is_err());
        assert!(CallerToken::create(&principal(), "").is_err());
    }

    #[test]
    fn test_expired_token() {
        let old = Utc::now() - chrono::Duration::seconds(600);
        let token = CallerToken::create_at(&principal(), "my-secret-key", old).unwrap();

        let err = token.validate("my-secret-key", Some(300)).unwrap_err();
        assert_eq!(kind(err), CredentialFailure::Expired);
    }

    #[test]
    fn test_future_token() {
        let future = Utc::now() + chrono::Duration::seconds(120);
        let token = CallerToken::create_at(&principal(), "k", future).unwrap();
        assert_eq!(kind(token.validate("k", None).unwrap_err()), CredentialFailure::NotYetValid);
    }

    #[test]
    fn test_small_clock_skew_tolerated() {
        let now = Utc::now();
        let token = CallerToken::create_at(&principal(), "k", now + chrono::Duration::seconds(10)).unwrap();
        token.validate_at("k", None, now).unwrap();
    }
}
