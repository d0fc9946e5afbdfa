//! Identity resolution: credential in, [`Principal`] out.

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{debug, warn};

use crate::caller_token::{CallerToken, DEFAULT_TTL_SECONDS};
use crate::error::{CredentialFailure, GatewayError};
use crate::types::Principal;

/// Validates a caller credential and produces the principal behind it.
///
/// Implement this trait to plug in another identity provider. Every failure
/// must be a [`GatewayError::InvalidCredential`].
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: Option<&str>) -> Result<Principal, GatewayError>;
}

/// Resolver for HMAC-signed [`CallerToken`]s with a revocation list.
pub struct HmacIdentityResolver {
    shared_secret: String,
    token_ttl_seconds: i64,
    revoked: DashSet<String>,
}

impl HmacIdentityResolver {
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            token_ttl_seconds: DEFAULT_TTL_SECONDS,
            revoked: DashSet::new(),
        }
    }

    pub fn with_token_ttl(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    /// Mint a signed bearer credential for `principal`.
    pub fn issue(&self, principal: &Principal) -> Result<String, GatewayError> {
        CallerToken::create(principal, &self.shared_secret)?.encode()
    }

    /// Revoke a token by id. Later presentations fail with `revoked`.
    pub fn revoke(&self, token_id: impl Into<String>) {
        self.revoked.insert(token_id.into());
    }

    pub fn is_revoked(&self, token_id: &str) -> bool {
        self.revoked.contains(token_id)
    }
}

#[async_trait]
impl IdentityResolver for HmacIdentityResolver {
    async fn resolve(&self, credential: Option<&str>) -> Result<Principal, GatewayError> {
        let raw = credential.ok_or_else(|| {
            GatewayError::invalid_credential(CredentialFailure::Missing, "no credential supplied")
        })?;

        let token = CallerToken::parse(raw).inspect_err(|e| {
            warn!(error = %e, "credential parse failed");
        })?;

        token
            .validate(&self.shared_secret, Some(self.token_ttl_seconds))
            .inspect_err(|e| {
                warn!(caller_id = %token.claims.caller_id, error = %e, "credential validation failed");
            })?;

        if self.is_revoked(&token.claims.token_id) {
            warn!(
                caller_id = %token.claims.caller_id,
                token_id = %token.claims.token_id,
                "revoked credential presented"
            );
            return Err(GatewayError::invalid_credential(
                CredentialFailure::Revoked,
                "token has been revoked",
            ));
        }

        let principal = token.principal();
        debug!(principal_id = %principal.id, tenant_id = %principal.tenant_id, tier = %principal.tier, "credential resolved");
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    fn kind(err: GatewayError) -> CredentialFailure {
        match err {
            GatewayError::InvalidCredential { kind, .. } => kind,
            other => panic!("expected InvalidCredential, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolves_issued_token() {
        let resolver = HmacIdentityResolver::new("secret");
        let principal = Principal::new("svc", "tenant-a", Tier::Enterprise).with_role("admin");
        let token = resolver.issue(&principal).unwrap();

        let resolved = resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(resolved, principal);
    }

    #[tokio::test]
    async fn missing_credential() {
        let resolver = HmacIdentityResolver::new("secret");
        let err = resolver.resolve(None).await.unwrap_err();
        assert_eq!(kind(err), CredentialFailure::Missing);
    }

    #[tokio::test]
    async fn revoked_token_rejected() {
        let resolver = HmacIdentityResolver::new("secret");
        let principal = Principal::new("u", "t", Tier::Free);
        let wire = resolver.issue(&principal).unwrap();
        let token_id = CallerToken::parse(&wire).unwrap().claims.token_id;

        resolver.revoke(token_id);
        let err = resolver.resolve(Some(&wire)).await.unwrap_err();
        assert_eq!(kind(err), CredentialFailure::Revoked);
    }

    #[tokio::test]
    async fn token_from_other_issuer_rejected() {
        let ours = HmacIdentityResolver::new("ours");
        let theirs = HmacIdentityResolver::new("theirs");
        let wire = theirs.issue(&Principal::new("u", "t", Tier::Free)).unwrap();
        let err = ours.resolve(Some(&wire)).await.unwrap_err();
        assert_eq!(kind(err), CredentialFailure::BadSignature);
    }
}
