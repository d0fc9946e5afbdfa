//! Gateway configuration.
//!
//! Every section is defaulted, so an empty TOML document is a valid (if
//! insecure) development config. [`GatewayConfig::validate`] must pass
//! before the gateway is built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditConfig, AuditSinkKind};
use crate::caller_token::DEFAULT_TTL_SECONDS;
use crate::quota::{QuotaConfig, TierLimits};
use crate::router::RouterConfig;
use crate::safety::SafetyConfig;
use crate::scanner::ScannerConfig;
use crate::types::QuotaDimension;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid pattern for detector '{name}': {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("unknown provider '{0}' in fallback chain")]
    UnknownProvider(String),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// HMAC secret shared with token issuers.
    pub shared_secret: String,
    pub token_ttl_seconds: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            token_ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// JSON or TOML rule file. The built-in rule set is used when absent.
    pub source: Option<PathBuf>,
    /// Seconds between reloads; 0 disables hot reload.
    pub refresh_interval_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source: None,
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub identity: IdentityConfig,
    pub quota: QuotaConfig,
    pub policy: PolicyConfig,
    pub scanner: ScannerConfig,
    pub safety: SafetyConfig,
    pub router: RouterConfig,
    pub audit: AuditConfig,
}

impl GatewayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject inconsistent values before anything is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_identity()?;
        self.validate_pipeline()
    }

    /// Checks for the built-in HMAC resolver only.
    pub fn validate_identity(&self) -> Result<(), ConfigError> {
        if self.identity.shared_secret.is_empty() {
            return Err(ConfigError::Invalid("identity.shared_secret must be set".into()));
        }
        if self.identity.token_ttl_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "identity.token_ttl_seconds must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Everything except identity.
    pub fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (tier, limits) in [
            ("free", &self.quota.free),
            ("premium", &self.quota.premium),
            ("enterprise", &self.quota.enterprise),
        ] {
            validate_tier(tier, limits)?;
        }

        let scanner = &self.scanner;
        if !(0.0..=1.0).contains(&scanner.confidence_threshold) {
            return invalid("scanner.confidence_threshold must be within [0, 1]".into());
        }
        for custom in &scanner.custom_patterns {
            if custom.entity_type.trim().is_empty() {
                return invalid("scanner.custom_patterns entry without entity_type".into());
            }
            regex::Regex::new(&custom.pattern).map_err(|e| ConfigError::InvalidPattern {
                name: custom.entity_type.clone(),
                reason: e.to_string(),
            })?;
        }

        let safety = &self.safety;
        if !(0.0..=1.0).contains(&safety.review_threshold)
            || !(0.0..=1.0).contains(&safety.block_threshold)
        {
            return invalid("safety thresholds must be within [0, 1]".into());
        }
        if safety.review_threshold >= safety.block_threshold {
            return invalid(format!(
                "safety.review_threshold ({}) must be below block_threshold ({})",
                safety.review_threshold, safety.block_threshold
            ));
        }
        if safety.max_chars == 0 {
            return invalid("safety.max_chars must be positive".into());
        }

        let router = &self.router;
        if router.request_deadline_ms == 0 || router.provider_timeout_ms == 0 {
            return invalid("router deadlines must be positive".into());
        }
        if router.breaker.failure_threshold == 0 || router.breaker.half_open_max_trials == 0 {
            return invalid("router.breaker thresholds must be positive".into());
        }
        let mut names = std::collections::BTreeSet::new();
        for provider in &router.providers {
            if provider.name.trim().is_empty() {
                return invalid("router.providers entry without name".into());
            }
            if !names.insert(provider.name.as_str()) {
                return invalid(format!("duplicate provider '{}'", provider.name));
            }
            if provider.weight == 0 {
                return invalid(format!("provider '{}' has zero weight", provider.name));
            }
            if provider.input_price_per_mtok < 0.0 || provider.output_price_per_mtok < 0.0 {
                return invalid(format!("provider '{}' has a negative price", provider.name));
            }
        }
        // Programmatic providers can still be added at build time, so an
        // unknown name is only an error when the list is fully configured.
        if !router.providers.is_empty() {
            for name in &router.fallback_chain {
                if !names.contains(name.as_str()) {
                    return Err(ConfigError::UnknownProvider(name.clone()));
                }
            }
        }

        if self.audit.sink == AuditSinkKind::Jsonl && self.audit.path.is_none() {
            return invalid("audit.path is required for the jsonl sink".into());
        }
        if self.audit.buffer_capacity == 0 {
            return invalid("audit.buffer_capacity must be positive".into());
        }

        Ok(())
    }
}

fn validate_tier(tier: &str, limits: &TierLimits) -> Result<(), ConfigError> {
    for dimension in QuotaDimension::ALL {
        let limit = limits.get(dimension);
        if !(limit.capacity > 0.0) || !(limit.refill_per_second > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "quota.{tier}.{dimension} needs positive capacity and refill rate"
            )));
        }
    }
    Ok(())
}
