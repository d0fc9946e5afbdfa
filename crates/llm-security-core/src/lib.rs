//! # LLM-Security-Core
//!
//! The security gateway every LLM request passes through on its way to a
//! model provider.
//!
//! ## Overview
//!
//! Each request is handled by a fixed pipeline:
//!
//! - **Identity**: HMAC-signed caller tokens resolve to a [`Principal`]
//! - **Quota**: per-principal token buckets for requests, tokens and cost
//! - **Policy**: hot-reloadable allow/deny rules decide model access
//! - **Scanning**: PII is detected and redacted before anything leaves
//! - **Safety**: prompt injection and abuse heuristics score the payload
//! - **Routing**: provider selection with circuit breakers, fallback and a deadline
//! - **Audit**: one hash-chainable record per request, written exactly once
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use llm_security_core::{HmacIdentityResolver, InboundRequest, Principal, SecurityGateway, Tier};
//! use llm_security_core::router::{provider::EchoProvider, ProviderEndpointConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = SecurityGateway::builder()
//!         .with_secret("my-shared-secret")
//!         .with_provider(ProviderEndpointConfig::named("local"), Arc::new(EchoProvider::new("local")))
//!         .build()
//!         .await?;
//!
//!     let principal = Principal::new("user-1", "tenant-a", Tier::Free);
//!     let token = HmacIdentityResolver::new("my-shared-secret").issue(&principal)?;
//!
//!     let response = gateway
//!         .process(InboundRequest::chat(token, "gpt-3.5-turbo", "My SSN is 123-45-6789"))
//!         .await?;
//!     assert!(response.security_events.pii_redacted);
//!     Ok(())
//! }
//! ```
//!
//! ## Custom identity
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use llm_security_core::error::CredentialFailure;
//! use llm_security_core::{GatewayError, IdentityResolver, Principal, Tier};
//!
//! struct HeaderIdentity;
//!
//! #[async_trait]
//! impl IdentityResolver for HeaderIdentity {
//!     async fn resolve(&self, credential: Option<&str>) -> Result<Principal, GatewayError> {
//!         match credential {
//!             Some(id) if !id.is_empty() => Ok(Principal::new(id, "default", Tier::Free)),
//!             _ => Err(GatewayError::invalid_credential(CredentialFailure::Missing, "no header")),
//!         }
//!     }
//! }
//! ```

pub mod audit;
pub mod caller_token;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod policy;
pub mod quota;
pub mod router;
pub mod safety;
pub mod scanner;
pub mod telemetry;
pub mod types;

// Primary exports
pub use audit::{AuditRecord, AuditRecorder, AuditSink, AuditTrail, FinalStatus};
pub use caller_token::CallerToken;
pub use config::{ConfigError, GatewayConfig};
pub use error::{ErrorCode, GatewayError};
pub use gateway::{GatewayHealth, PipelineState, SecurityGateway, SecurityGatewayBuilder};
pub use identity::{HmacIdentityResolver, IdentityResolver};
pub use policy::{PolicyAuthorizer, PolicyDecision, PolicySource, RuleSet};
pub use quota::QuotaLimiter;
pub use router::{ModelRouter, RoutingDecision};
pub use safety::{ContentSafetyFilter, SafetyAssessment, SafetyVerdict};
pub use scanner::{Detector, ScanOutcome, SensitiveDataScanner};
pub use types::{
    ChatMessage, GatewayRequest, GatewayResponse, InboundRequest, Principal, QuotaDimension,
    SecurityEvents, Tier, Usage,
};
