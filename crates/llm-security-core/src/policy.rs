//! Rule-based policy interface for authorization decisions.
//!
//! Rules are data. A [`RuleSet`] is fetched from a [`PolicySource`],
//! validated, and published behind an `Arc` that readers clone; a reload
//! swaps the pointer and never blocks an in-flight evaluation.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::types::{Principal, Tier};

/// Errors raised while loading or evaluating rule data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid rule set: {0}")]
    Invalid(String),

    #[error("policy source unavailable: {0}")]
    Source(String),

    #[error("failed to parse rule set: {0}")]
    Parse(String),
}

impl From<PolicyError> for GatewayError {
    fn from(err: PolicyError) -> Self {
        GatewayError::PolicyEvaluation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

/// One declarative rule. Absent or empty conditions match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub effect: Effect,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    /// Matches when the principal holds any of these roles.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub tenants: Vec<String>,
    /// Model names; a trailing `*` matches any suffix.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl PolicyRule {
    fn matches(&self, principal: &Principal, model: &str, action: &str) -> Result<bool, PolicyError> {
        if !self.tiers.is_empty() && !self.tiers.contains(&principal.tier) {
            return Ok(false);
        }
        if !self.roles.is_empty() && !self.roles.iter().any(|r| principal.has_role(r)) {
            return Ok(false);
        }
        if !self.tenants.is_empty() && !self.tenants.iter().any(|t| t == &principal.tenant_id) {
            return Ok(false);
        }
        if !self.actions.is_empty() && !self.actions.iter().any(|a| a == action) {
            return Ok(false);
        }
        if self.models.is_empty() {
            return Ok(true);
        }
        for pattern in &self.models {
            if model_matches(&self.id, pattern, model)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn model_matches(rule_id: &str, pattern: &str, model: &str) -> Result<bool, PolicyError> {
    match pattern.find('*') {
        None => Ok(pattern == model),
        Some(pos) if pos == pattern.len() - 1 => Ok(model.starts_with(&pattern[..pos])),
        Some(_) => Err(PolicyError::Invalid(format!(
            "rule '{rule_id}': wildcard only allowed as trailing character in '{pattern}'"
        ))),
    }
}

/// A versioned, ordered set of rules plus the model catalogue they govern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    /// Every model the gateway knows about.
    pub models: Vec<String>,
    pub rules: Vec<PolicyRule>,
}

/// Outcome of evaluating one (principal, model, action) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub allowed: bool,
    /// Id of the deciding rule; `None` means the default deny applied.
    pub rule_id: Option<String>,
}

impl RuleSet {
    /// Check structural validity. Called on every load; a rule set that
    /// fails here is never published.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.version.trim().is_empty() {
            return Err(PolicyError::Invalid("version must not be empty".into()));
        }
        if self.models.is_empty() {
            return Err(PolicyError::Invalid("model catalogue must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(PolicyError::Invalid("rule id must not be empty".into()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(PolicyError::Invalid(format!("duplicate rule id '{}'", rule.id)));
            }
            for pattern in &rule.models {
                if pattern.is_empty() {
                    return Err(PolicyError::Invalid(format!(
                        "rule '{}': empty model pattern",
                        rule.id
                    )));
                }
                model_matches(&rule.id, pattern, "")?;
            }
        }
        Ok(())
    }

    /// Deny rules take precedence over allow rules; no match means deny.
    pub fn evaluate(
        &self,
        principal: &Principal,
        model: &str,
        action: &str,
    ) -> Result<RuleMatch, PolicyError> {
        let mut first_allow = None;
        for rule in &self.rules {
            if !rule.matches(principal, model, action)? {
                continue;
            }
            match rule.effect {
                Effect::Deny => {
                    return Ok(RuleMatch {
                        allowed: false,
                        rule_id: Some(rule.id.clone()),
                    })
                }
                Effect::Allow => {
                    if first_allow.is_none() {
                        first_allow = Some(rule.id.clone());
                    }
                }
            }
        }
        Ok(RuleMatch {
            allowed: first_allow.is_some(),
            rule_id: first_allow,
        })
    }

    /// The default rule set: tier-based model access, `admin` sees
    /// everything, `suspended` sees nothing.
    pub fn builtin() -> Self {
        let rule = |id: &str, effect: Effect| PolicyRule {
            id: id.to_string(),
            effect,
            tiers: Vec::new(),
            roles: Vec::new(),
            tenants: Vec::new(),
            models: Vec::new(),
            actions: Vec::new(),
        };
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            version: "builtin-1".to_string(),
            models: strings(&[
                "gpt-3.5-turbo",
                "gpt-4",
                "claude-3-sonnet",
                "claude-3-opus",
                "local",
            ]),
            rules: vec![
                PolicyRule {
                    roles: strings(&["suspended"]),
                    ..rule("deny-suspended", Effect::Deny)
                },
                PolicyRule {
                    roles: strings(&["admin"]),
                    ..rule("allow-admin", Effect::Allow)
                },
                PolicyRule {
                    tiers: vec![Tier::Free],
                    models: strings(&["gpt-3.5-turbo", "claude-3-sonnet", "local"]),
                    actions: strings(&["chat"]),
                    ..rule("allow-free-small-models", Effect::Allow)
                },
                PolicyRule {
                    tiers: vec![Tier::Premium],
                    models: strings(&["gpt-3.5-turbo", "gpt-4", "claude-3-sonnet", "local"]),
                    ..rule("allow-premium", Effect::Allow)
                },
                PolicyRule {
                    tiers: vec![Tier::Enterprise],
                    models: strings(&["*"]),
                    ..rule("allow-enterprise", Effect::Allow)
                },
            ],
        }
    }
}

/// Result of a policy authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the operation is allowed.
    pub allowed: bool,
    /// Catalogue models this principal may use for the requested action.
    pub allowed_models: BTreeSet<String>,
    /// Deciding rule or the default-deny note. Internal; never sent to clients.
    pub reason: Option<String>,
    /// Version of the rule set that produced this decision.
    pub policy_version: String,
}

impl PolicyDecision {
    /// Create an "allowed" decision.
    pub fn allow(allowed_models: BTreeSet<String>, policy_version: impl Into<String>) -> Self {
        Self {
            allowed: true,
            allowed_models,
            reason: None,
            policy_version: policy_version.into(),
        }
    }

    /// Create a "denied" decision with a reason.
    pub fn deny(
        reason: impl Into<String>,
        allowed_models: BTreeSet<String>,
        policy_version: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            allowed_models,
            reason: Some(reason.into()),
            policy_version: policy_version.into(),
        }
    }
}

/// Where rule sets come from.
///
/// Implement this trait to load rules from a policy repository, a config
/// service, or anything else.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self) -> Result<RuleSet, PolicyError>;

    /// Human-readable location, used in logs.
    fn describe(&self) -> String;
}

/// A fixed rule set held in memory.
pub struct StaticPolicySource {
    rules: RuleSet,
}

impl StaticPolicySource {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn fetch(&self) -> Result<RuleSet, PolicyError> {
        Ok(self.rules.clone())
    }

    fn describe(&self) -> String {
        format!("static:{}", self.rules.version)
    }
}

/// Rule set read from a JSON or TOML file, chosen by extension.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch(&self) -> Result<RuleSet, PolicyError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PolicyError::Source(format!("{}: {e}", self.path.display())))?;
        let is_toml = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&raw).map_err(|e| PolicyError::Parse(e.to_string()))
        } else {
            serde_json::from_str(&raw).map_err(|e| PolicyError::Parse(e.to_string()))
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

struct ActiveRules {
    rules: Arc<RuleSet>,
    loaded_at: Instant,
}

/// Evaluates the active rule set and keeps it fresh.
pub struct PolicyAuthorizer {
    source: Arc<dyn PolicySource>,
    active: RwLock<Arc<ActiveRules>>,
}

impl PolicyAuthorizer {
    /// Load the initial rule set. Startup fails if it cannot be loaded,
    /// since there is no previous version to fall back to.
    pub async fn load(source: Arc<dyn PolicySource>) -> Result<Self, PolicyError> {
        let rules = source.fetch().await?;
        rules.validate()?;
        info!(source = %source.describe(), version = %rules.version, rules = rules.rules.len(), "policy loaded");
        Ok(Self {
            source,
            active: RwLock::new(Arc::new(ActiveRules {
                rules: Arc::new(rules),
                loaded_at: Instant::now(),
            })),
        })
    }

    /// Authorizer over a fixed rule set.
    pub fn from_rules(rules: RuleSet) -> Result<Self, PolicyError> {
        rules.validate()?;
        Ok(Self {
            source: Arc::new(StaticPolicySource::new(rules.clone())),
            active: RwLock::new(Arc::new(ActiveRules {
                rules: Arc::new(rules),
                loaded_at: Instant::now(),
            })),
        })
    }

    fn snapshot(&self) -> Arc<ActiveRules> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// The currently published rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.snapshot().rules)
    }

    pub fn version(&self) -> String {
        self.snapshot().rules.version.clone()
    }

    /// Time since the active rule set was loaded.
    pub fn staleness(&self) -> Duration {
        self.snapshot().loaded_at.elapsed()
    }

    /// Decide whether `principal` may perform `action` on `model`.
    ///
    /// A deny is a normal `Ok` decision; `Err` only signals broken rule data.
    pub fn authorize(
        &self,
        principal: &Principal,
        model: &str,
        action: &str,
    ) -> Result<PolicyDecision, GatewayError> {
        let rules = self.rules();

        let mut allowed_models = BTreeSet::new();
        for candidate in &rules.models {
            if rules.evaluate(principal, candidate, action)?.allowed {
                allowed_models.insert(candidate.clone());
            }
        }

        let verdict = rules.evaluate(principal, model, action).inspect_err(|e| {
            error!(principal_id = %principal.id, version = %rules.version, error = %e, "policy evaluation failed");
        })?;

        let decision = if verdict.allowed {
            PolicyDecision::allow(allowed_models, rules.version.clone())
        } else {
            let reason = match verdict.rule_id {
                Some(id) => format!("deny rule '{id}' matched"),
                None => "no allow rule matched".to_string(),
            };
            PolicyDecision::deny(reason, allowed_models, rules.version.clone())
        };
        debug!(
            principal_id = %principal.id,
            model,
            action,
            allowed = decision.allowed,
            version = %decision.policy_version,
            "policy decision"
        );
        Ok(decision)
    }

    /// Fetch and publish a new rule set. On any failure the previous set
    /// stays active and a staleness warning is logged.
    pub async fn reload(&self) -> Result<String, PolicyError> {
        let fetched = self.source.fetch().await.and_then(|rules| {
            rules.validate()?;
            Ok(rules)
        });

        match fetched {
            Ok(rules) => {
                let version = rules.version.clone();
                let next = Arc::new(ActiveRules {
                    rules: Arc::new(rules),
                    loaded_at: Instant::now(),
                });
                match self.active.write() {
                    Ok(mut guard) => *guard = next,
                    Err(poisoned) => *poisoned.into_inner() = next,
                }
                info!(source = %self.source.describe(), version = %version, "policy reloaded");
                Ok(version)
            }
            Err(e) => {
                let active = self.snapshot();
                warn!(
                    source = %self.source.describe(),
                    active_version = %active.rules.version,
                    stale_for_secs = active.loaded_at.elapsed().as_secs(),
                    error = %e,
                    "policy reload failed, serving stale rule set"
                );
                Err(e)
            }
        }
    }

    /// Reload on a fixed interval until the handle is aborted.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let authorizer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = authorizer.reload().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn free() -> Principal {
        Principal::new("u1", "tenant-a", Tier::Free)
    }

    /// Source whose next answer can be swapped by the test.
    struct ScriptedSource {
        next: Mutex<Result<RuleSet, PolicyError>>,
    }

    #[async_trait]
    impl PolicySource for ScriptedSource {
        async fn fetch(&self) -> Result<RuleSet, PolicyError> {
            self.next.lock().unwrap().clone()
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[test]
    fn free_tier_gets_small_models() {
        let authz = PolicyAuthorizer::from_rules(RuleSet::builtin()).unwrap();
        let decision = authz.authorize(&free(), "gpt-3.5-turbo", "chat").unwrap();
        assert!(decision.allowed);
        assert!(decision.allowed_models.contains("claude-3-sonnet"));
        assert!(!decision.allowed_models.contains("gpt-4"));

        let denied = authz.authorize(&free(), "gpt-4", "chat").unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("no allow rule matched"));
    }

    #[test]
    fn deny_takes_precedence() {
        let authz = PolicyAuthorizer::from_rules(RuleSet::builtin()).unwrap();
        let p = Principal::new("u2", "t", Tier::Enterprise)
            .with_role("admin")
            .with_role("suspended");
        let decision = authz.authorize(&p, "gpt-4", "chat").unwrap();
        assert!(!decision.allowed);
        assert!(decision.allowed_models.is_empty());
        assert_eq!(decision.reason.as_deref(), Some("deny rule 'deny-suspended' matched"));
    }

    #[test]
    fn default_is_deny() {
        let rules = RuleSet {
            version: "v1".into(),
            models: vec!["m".into()],
            rules: vec![],
        };
        let authz = PolicyAuthorizer::from_rules(rules).unwrap();
        assert!(!authz.authorize(&free(), "m", "chat").unwrap().allowed);
    }

    #[test]
    fn authorize_is_idempotent() {
        let authz = PolicyAuthorizer::from_rules(RuleSet::builtin()).unwrap();
        let p = Principal::new("u3", "tenant-b", Tier::Premium).with_role("analyst");
        let first = authz.authorize(&p, "claude-3-opus", "chat").unwrap();
        let second = authz.authorize(&p, "claude-3-opus", "chat").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn trailing_wildcard_and_tenant_conditions() {
        let rules = RuleSet {
            version: "v2".into(),
            models: vec!["claude-3-opus".into(), "gpt-4".into()],
            rules: vec![PolicyRule {
                id: "tenant-a-claude".into(),
                effect: Effect::Allow,
                tiers: vec![],
                roles: vec![],
                tenants: vec!["tenant-a".into()],
                models: vec!["claude-*".into()],
                actions: vec![],
            }],
        };
        let authz = PolicyAuthorizer::from_rules(rules).unwrap();
        assert!(authz.authorize(&free(), "claude-3-opus", "chat").unwrap().allowed);
        assert!(!authz.authorize(&free(), "gpt-4", "chat").unwrap().allowed);
        let other = Principal::new("u9", "tenant-z", Tier::Free);
        assert!(!authz.authorize(&other, "claude-3-opus", "chat").unwrap().allowed);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        let mut rules = RuleSet::builtin();
        rules.rules[2].models = vec!["gpt-*-turbo".into()];
        assert!(matches!(rules.validate(), Err(PolicyError::Invalid(_))));

        let mut dup = RuleSet::builtin();
        dup.rules[1].id = dup.rules[0].id.clone();
        assert!(PolicyAuthorizer::from_rules(dup).is_err());
    }

    #[test]
    fn unvalidated_bad_pattern_is_evaluation_error() {
        let mut rules = RuleSet::builtin();
        rules.rules.push(PolicyRule {
            models: vec!["g*t".into()],
            ..rules.rules[4].clone()
        });
        let p = Principal::new("e", "t", Tier::Enterprise);
        let err: GatewayError = rules.evaluate(&p, "gpt-4", "chat").map(|_| ()).unwrap_err().into();
        assert_eq!(err.code(), crate::error::ErrorCode::PolicyEvaluationError);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_version() {
        let source = Arc::new(ScriptedSource {
            next: Mutex::new(Ok(RuleSet::builtin())),
        });
        let authz = PolicyAuthorizer::load(source.clone()).await.unwrap();
        assert_eq!(authz.version(), "builtin-1");

        *source.next.lock().unwrap() = Err(PolicyError::Source("connection refused".into()));
        assert!(authz.reload().await.is_err());
        assert_eq!(authz.version(), "builtin-1");

        let mut broken = RuleSet::builtin();
        broken.version = "v-broken".into();
        broken.models.clear();
        *source.next.lock().unwrap() = Ok(broken);
        assert!(authz.reload().await.is_err());
        assert_eq!(authz.version(), "builtin-1");

        let mut next = RuleSet::builtin();
        next.version = "builtin-2".into();
        *source.next.lock().unwrap() = Ok(next);
        assert_eq!(authz.reload().await.unwrap(), "builtin-2");
        assert_eq!(authz.version(), "builtin-2");
    }

    #[tokio::test]
    async fn file_source_reads_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let rules = RuleSet::builtin();

        let json_path = dir.path().join("rules.json");
        std::fs::write(&json_path, serde_json::to_string(&rules).unwrap()).unwrap();
        assert_eq!(FilePolicySource::new(&json_path).fetch().await.unwrap(), rules);

        let toml_path = dir.path().join("rules.toml");
        std::fs::write(&toml_path, toml::to_string(&rules).unwrap()).unwrap();
        assert_eq!(FilePolicySource::new(&toml_path).fetch().await.unwrap(), rules);

        let missing = FilePolicySource::new(dir.path().join("nope.json"));
        assert!(matches!(missing.fetch().await, Err(PolicyError::Source(_))));
    }
}
