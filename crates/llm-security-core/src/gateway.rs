//! SecurityGateway - the request pipeline every LLM call goes through.
//!
//! Each request walks a strict sequence of stages:
//!
//! ```text
//! Received -> Authenticated -> QuotaChecked -> Authorized -> Scanned
//!          -> SafetyChecked -> Routed -> Completed
//! ```
//!
//! The first failing stage short-circuits the rest. Whatever happens, the
//! request's [`AuditTrail`] is finalized exactly once: explicitly on every
//! return path, and by its `Drop` impl if the future is dropped mid-flight.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit::{AuditHealth, AuditRecorder, AuditSink, AuditTrail, FinalStatus};
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{ErrorCode, GatewayError};
use crate::identity::{HmacIdentityResolver, IdentityResolver};
use crate::policy::{
    FilePolicySource, PolicyAuthorizer, PolicySource, RuleSet, StaticPolicySource,
};
use crate::quota::QuotaLimiter;
use crate::router::provider::Provider;
use crate::router::{
    ModelRouter, ProviderEndpoint, ProviderEndpointConfig, RouteRequest, RoutedCall,
};
use crate::router::breaker::CircuitState;
use crate::safety::{ContentSafetyFilter, SafetyVerdict};
use crate::scanner::{Detector, SensitiveDataScanner};
use crate::telemetry;
use crate::types::{
    new_request_id, GatewayRequest, GatewayResponse, InboundRequest, QuotaDimension,
    SecurityEvents, Usage,
};

pub const STAGE_AUTH: &str = "auth";
pub const STAGE_QUOTA: &str = "quota";
pub const STAGE_POLICY: &str = "policy";
pub const STAGE_SCAN: &str = "scan";
pub const STAGE_SAFETY: &str = "safety";
pub const STAGE_ROUTE: &str = "route";
pub const STAGE_PROVIDER_CALL: &str = "provider_call";
pub const STAGE_RESPONSE_SCAN: &str = "response_scan";

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Authenticated,
    QuotaChecked,
    Authorized,
    Scanned,
    SafetyChecked,
    Routed,
    Completed,
    Rejected,
    Failed,
}

impl PipelineState {
    /// The stage that runs after this state; the one blamed if it fails.
    pub fn next_stage(&self) -> &'static str {
        match self {
            PipelineState::Received => STAGE_AUTH,
            PipelineState::Authenticated => STAGE_QUOTA,
            PipelineState::QuotaChecked => STAGE_POLICY,
            PipelineState::Authorized => STAGE_SCAN,
            PipelineState::Scanned => STAGE_SAFETY,
            PipelineState::SafetyChecked => STAGE_ROUTE,
            PipelineState::Routed => STAGE_RESPONSE_SCAN,
            PipelineState::Completed | PipelineState::Rejected | PipelineState::Failed => {
                "terminal"
            }
        }
    }
}

/// Readiness view for the health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub status: &'static str,
    pub policy_version: String,
    pub policy_age_secs: u64,
    pub audit: AuditHealth,
    pub providers: Vec<ProviderEndpoint>,
}

impl GatewayHealth {
    pub fn is_ready(&self) -> bool {
        self.status == "ok"
    }
}

/// The gateway. Cheap to share behind an `Arc`; every request gets its own
/// pipeline instance and only the quota buckets, breaker state and policy
/// cache are shared.
pub struct SecurityGateway {
    identity: Arc<dyn IdentityResolver>,
    quota: QuotaLimiter,
    policy: Arc<PolicyAuthorizer>,
    scanner: SensitiveDataScanner,
    safety: ContentSafetyFilter,
    router: Arc<ModelRouter>,
    audit: AuditRecorder,
    request_deadline: Duration,
    scan_responses: bool,
    background: Vec<JoinHandle<()>>,
}

impl SecurityGateway {
    pub fn builder() -> SecurityGatewayBuilder {
        SecurityGatewayBuilder::new()
    }

    pub fn quota(&self) -> &QuotaLimiter {
        &self.quota
    }

    pub fn policy(&self) -> &Arc<PolicyAuthorizer> {
        &self.policy
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn health(&self) -> GatewayHealth {
        let providers = self.router.endpoint_snapshots();
        let audit = self.audit.health();
        let any_provider = providers.iter().any(|p| p.health_state != CircuitState::Open);
        GatewayHealth {
            status: if any_provider && !audit.is_degraded() {
                "ok"
            } else {
                "degraded"
            },
            policy_version: self.policy.version(),
            policy_age_secs: self.policy.staleness().as_secs(),
            audit,
            providers,
        }
    }

    /// Run one request through the pipeline.
    pub async fn process(&self, inbound: InboundRequest) -> Result<GatewayResponse, GatewayError> {
        self.process_with_cancel(inbound, CancellationToken::new()).await
    }

    /// Like [`SecurityGateway::process`], aborting the current stage when
    /// `cancel` fires or the request deadline passes. Either way the audit
    /// record is finalized `cancelled`. A provider call that is already in
    /// flight keeps running detached; its outcome and cost land in the same
    /// audit record.
    pub async fn process_with_cancel(
        &self,
        inbound: InboundRequest,
        cancel: CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let request_id = new_request_id();
        let started = Instant::now();
        let deadline = started + self.request_deadline;
        let trail = self.audit.begin(request_id.clone());
        if let Some(correlation_id) = &inbound.correlation_id {
            if let Err(e) = trail.set_correlation_id(correlation_id) {
                error!(error = %e, "audit correlation id not recorded");
            }
        }
        let span = info_span!(
            "gateway_request",
            request_id = %request_id,
            correlation_id = inbound.correlation_id.as_deref().unwrap_or(""),
            principal_id = tracing::field::Empty
        );

        let mut state = PipelineState::Received;
        let outcome = tokio::select! {
            biased;
            result = self
                .run(&inbound, &request_id, &trail, deadline, &mut state)
                .instrument(span.clone()) => result.map_err(|e| (e, None)),
            _ = cancel.cancelled() => Err((
                GatewayError::Cancelled("caller disconnected".into()),
                Some("caller_gone"),
            )),
            _ = tokio::time::sleep_until(deadline) => Err((
                GatewayError::ProviderTimeout("request deadline exceeded".into()),
                Some("deadline"),
            )),
        };

        let _enter = span.enter();
        let elapsed = started.elapsed();
        match outcome {
            Ok(response) => {
                if let Err(e) = trail.finalize(FinalStatus::Completed, None) {
                    error!(error = %e, "audit finalize failed");
                }
                telemetry::record_request(FinalStatus::Completed.as_str(), elapsed);
                info!(
                    state = ?PipelineState::Completed,
                    duration_ms = elapsed.as_millis() as u64,
                    cost = response.usage.cost,
                    "request completed"
                );
                Ok(response)
            }
            Err((err, cancelled)) => {
                let code = err.code();
                // The router gives up at the same deadline and may report it
                // before the timer above fires.
                let cancelled = cancelled.or_else(|| {
                    (code == ErrorCode::ProviderTimeout && Instant::now() >= deadline)
                        .then_some("deadline")
                });
                let stage = state.next_stage();
                let status = match cancelled {
                    Some(_) => FinalStatus::Cancelled,
                    None if code.is_internal() || matches!(
                        code,
                        ErrorCode::ProviderTimeout | ErrorCode::AllProvidersUnavailable
                    ) => FinalStatus::Failed,
                    None => FinalStatus::Rejected,
                };
                let terminal = if status == FinalStatus::Rejected {
                    PipelineState::Rejected
                } else {
                    PipelineState::Failed
                };

                if !trail.is_finalized() {
                    if !trail.has_stage(stage) {
                        let _ = trail.record(
                            stage,
                            status.as_str(),
                            json!({ "code": code.as_str(), "detail": err.to_string() }),
                        );
                    }
                    let detail = cancelled.map_or_else(|| stage.to_string(), |c| format!("{stage}:{c}"));
                    if let Err(e) = trail.finalize(status, Some(detail)) {
                        error!(error = %e, "audit finalize failed");
                    }
                }

                telemetry::record_request(status.as_str(), elapsed);
                telemetry::record_rejection(code);
                if code.is_internal() {
                    error!(stage, code = %code, error = %err, from = ?state, to = ?terminal, "request failed");
                } else {
                    warn!(stage, code = %code, from = ?state, to = ?terminal, "request not completed");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        inbound: &InboundRequest,
        request_id: &str,
        trail: &AuditTrail,
        deadline: Instant,
        state: &mut PipelineState,
    ) -> Result<GatewayResponse, GatewayError> {
        // Authenticate
        let principal = self.identity.resolve(inbound.credential.as_deref()).await?;
        tracing::Span::current().record("principal_id", principal.id.as_str());
        trail.set_principal(&principal)?;
        trail.set_target_model(&inbound.target_model)?;
        trail.record(STAGE_AUTH, "ok", json!({ "tier": principal.tier.as_str() }))?;
        *state = PipelineState::Authenticated;

        let request = GatewayRequest::new(request_id.to_string(), principal, inbound);

        // Quota. No refund if a later stage rejects.
        let prompt_tokens = request.estimated_prompt_tokens();
        let max_out = u64::from(request.max_output_tokens);
        let estimated_cost = self
            .router
            .estimate_cost(&request.target_model, prompt_tokens, max_out);
        self.quota.admit_all(
            &request.principal,
            &[
                (QuotaDimension::Requests, 1.0),
                (QuotaDimension::Tokens, request.estimated_total_tokens() as f64),
                (QuotaDimension::Cost, estimated_cost),
            ],
        )?;
        trail.record(
            STAGE_QUOTA,
            "admitted",
            json!({ "tokens": request.estimated_total_tokens(), "estimated_cost": estimated_cost }),
        )?;
        *state = PipelineState::QuotaChecked;

        // Authorize
        let decision = self
            .policy
            .authorize(&request.principal, &request.target_model, &request.action)?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_default();
            trail.record(
                STAGE_POLICY,
                "denied",
                json!({ "reason": reason, "policy_version": decision.policy_version }),
            )?;
            return Err(GatewayError::PolicyDenied(reason));
        }
        trail.record(
            STAGE_POLICY,
            "allowed",
            json!({ "policy_version": decision.policy_version }),
        )?;
        *state = PipelineState::Authorized;

        // Scan and redact. Everything downstream sees the redacted copy.
        let (redacted_messages, scan) = self.scanner.scan_messages(&request.messages);
        let counts = scan.entity_counts();
        for (entity, count) in &counts {
            telemetry::record_pii(entity, *count);
        }
        let mut entities = scan.entity_types();
        trail.add_pii_entities(&entities)?;
        trail.record(
            STAGE_SCAN,
            if scan.pii_detected() { "redacted" } else { "clean" },
            json!({ "entities": counts }),
        )?;
        let request = request.with_messages(redacted_messages);
        *state = PipelineState::Scanned;

        // Content safety
        let assessment = self.safety.assess(&request.payload_text);
        let safety_meta = json!({
            "risk_score": assessment.risk_score,
            "triggered_rules": assessment.triggered_rules,
        });
        let flagged = match assessment.verdict {
            SafetyVerdict::Block => {
                trail.record(STAGE_SAFETY, "blocked", safety_meta)?;
                return Err(GatewayError::ContentPolicyViolation {
                    score: assessment.risk_score,
                    rules: assessment.triggered_rules,
                });
            }
            SafetyVerdict::Review => {
                trail.flag_for_review()?;
                trail.record(STAGE_SAFETY, "review", safety_meta)?;
                true
            }
            SafetyVerdict::Pass => {
                trail.record(STAGE_SAFETY, "pass", safety_meta)?;
                false
            }
        };
        *state = PipelineState::SafetyChecked;

        // Route
        let routed = self
            .dispatch(&request, decision.allowed_models, trail, deadline)
            .await?;
        trail.record(
            STAGE_ROUTE,
            "ok",
            json!({
                "provider": routed.decision.chosen_provider,
                "position": routed.decision.fallback_chain_position,
            }),
        )?;
        *state = PipelineState::Routed;

        // Response scan
        let mut content = routed.output.text;
        if self.scan_responses {
            let out_scan = self.scanner.scan_and_redact(&content);
            if out_scan.pii_detected() {
                let out_entities = out_scan.entity_types();
                trail.add_pii_entities(&out_entities)?;
                entities.extend(out_entities);
                entities.sort();
                entities.dedup();
            }
            trail.record(
                STAGE_RESPONSE_SCAN,
                if out_scan.pii_detected() { "redacted" } else { "clean" },
                json!({ "entities": out_scan.entity_counts() }),
            )?;
            content = out_scan.redacted_text;
        }

        debug!(provider = %routed.decision.chosen_provider, "response ready");
        Ok(GatewayResponse {
            request_id: request.id,
            model: request.target_model,
            content,
            usage: Usage {
                prompt_tokens: routed.output.prompt_tokens,
                completion_tokens: routed.output.completion_tokens,
                cost: routed.cost,
            },
            security_events: SecurityEvents {
                pii_redacted: !entities.is_empty(),
                entities,
                flagged_for_review: flagged,
            },
        })
    }

    /// Run the provider call on its own task so that a cancelled request
    /// still gets its call outcome and cost recorded.
    async fn dispatch(
        &self,
        request: &GatewayRequest,
        allowed_models: std::collections::BTreeSet<String>,
        trail: &AuditTrail,
        deadline: Instant,
    ) -> Result<RoutedCall, GatewayError> {
        let pending = trail.reserve(STAGE_PROVIDER_CALL)?;
        let route_request = RouteRequest {
            request_id: request.id.clone(),
            model: request.target_model.clone(),
            payload: request.payload_text.clone(),
            messages: request.messages.clone(),
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            task_type: request.task_type.clone(),
            estimated_tokens: request.estimated_total_tokens(),
            allowed_models,
        };
        let router = Arc::clone(&self.router);

        let call = tokio::spawn(
            async move {
                let result = router.route_and_call(&route_request, deadline).await;
                match &result {
                    Ok(call) => pending.complete(
                        "ok",
                        json!({ "attempts": call.attempts }),
                        call.cost,
                        Some(call.decision.clone()),
                    ),
                    Err(failure) => pending.complete(
                        failure.error.code().as_str(),
                        json!({ "attempts": failure.attempts }),
                        0.0,
                        None,
                    ),
                }
                result
            }
            .in_current_span(),
        );

        match call.await {
            Ok(Ok(routed)) => Ok(routed),
            Ok(Err(failure)) => Err(failure.error),
            Err(e) => Err(GatewayError::Internal(format!("provider task ended abnormally: {e}"))),
        }
    }
}

impl Drop for SecurityGateway {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

/// Builder for [`SecurityGateway`].
///
/// Components not supplied explicitly are built from the [`GatewayConfig`].
pub struct SecurityGatewayBuilder {
    config: GatewayConfig,
    identity: Option<Arc<dyn IdentityResolver>>,
    policy_source: Option<Arc<dyn PolicySource>>,
    providers: Vec<(ProviderEndpointConfig, Arc<dyn Provider>)>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    detectors: Vec<Box<dyn Detector>>,
    background_tasks: bool,
}

impl SecurityGatewayBuilder {
    fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            identity: None,
            policy_source: None,
            providers: Vec::new(),
            audit_sink: None,
            detectors: Vec::new(),
            background_tasks: true,
        }
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the shared secret for the built-in HMAC resolver.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.identity.shared_secret = secret.into();
        self
    }

    /// Replace the HMAC resolver with another identity provider.
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_policy_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.policy_source = Some(source);
        self
    }

    pub fn with_rules(self, rules: RuleSet) -> Self {
        self.with_policy_source(Arc::new(StaticPolicySource::new(rules)))
    }

    /// Register a backend in addition to the configured ones.
    pub fn with_provider(
        mut self,
        endpoint: ProviderEndpointConfig,
        provider: Arc<dyn Provider>,
    ) -> Self {
        self.providers.push((endpoint, provider));
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Skip the policy refresh and health probe tasks.
    pub fn without_background_tasks(mut self) -> Self {
        self.background_tasks = false;
        self
    }

    /// Build the gateway. Must run inside a tokio runtime.
    pub async fn build(self) -> Result<SecurityGateway, ConfigError> {
        let config = self.config;
        if self.identity.is_none() {
            config.validate_identity()?;
        }
        config.validate_pipeline()?;

        let identity: Arc<dyn IdentityResolver> = match self.identity {
            Some(identity) => identity,
            None => Arc::new(
                HmacIdentityResolver::new(config.identity.shared_secret.clone())
                    .with_token_ttl(config.identity.token_ttl_seconds),
            ),
        };

        let source: Arc<dyn PolicySource> = match (self.policy_source, &config.policy.source) {
            (Some(source), _) => source,
            (None, Some(path)) => Arc::new(FilePolicySource::new(path.clone())),
            (None, None) => Arc::new(StaticPolicySource::new(RuleSet::builtin())),
        };
        let policy = Arc::new(
            PolicyAuthorizer::load(source)
                .await
                .map_err(|e| ConfigError::Load(e.to_string()))?,
        );

        let mut scanner = SensitiveDataScanner::new(&config.scanner)?;
        for detector in self.detectors {
            scanner.add_detector(detector);
        }

        let router = Arc::new(ModelRouter::from_config(config.router.clone(), self.providers)?);

        let sink = match self.audit_sink {
            Some(sink) => sink,
            None => config
                .audit
                .build_sink()
                .map_err(|e| ConfigError::Load(e.to_string()))?,
        };
        let audit = AuditRecorder::spawn(sink, &config.audit);

        let mut background = Vec::new();
        if self.background_tasks {
            if config.policy.refresh_interval_secs > 0 {
                background.push(
                    policy.spawn_refresh(Duration::from_secs(config.policy.refresh_interval_secs)),
                );
            }
            if config.router.health_probe_interval_secs > 0 {
                background.push(router.spawn_health_probe(Duration::from_secs(
                    config.router.health_probe_interval_secs,
                )));
            }
        }

        info!(
            policy_version = %policy.version(),
            providers = router.endpoint_snapshots().len(),
            strategy = %config.router.strategy,
            "security gateway ready"
        );

        Ok(SecurityGateway {
            identity,
            quota: QuotaLimiter::new(config.quota.clone()),
            policy,
            scanner,
            safety: ContentSafetyFilter::new(config.safety.clone()),
            router,
            audit,
            request_deadline: config.router.request_deadline(),
            scan_responses: config.scanner.scan_responses,
            background,
        })
    }
}
