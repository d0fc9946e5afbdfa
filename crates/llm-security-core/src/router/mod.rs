//! Model routing: endpoint selection, circuit breaking and fallback.
//!
//! For every request the router builds a candidate chain (the strategy's
//! pick first, then the configured fallback order), skips endpoints whose
//! breaker is open, and walks the chain until one call succeeds. Each
//! attempt gets `min(endpoint timeout, time left before the deadline)`;
//! the overall request deadline always wins.

pub mod breaker;
pub mod http_provider;
pub mod provider;
pub mod strategy;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::GatewayError;
use crate::types::ChatMessage;

use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use http_provider::HttpProvider;
use provider::{EchoProvider, Provider, ProviderError, ProviderOutput, ProviderRequest};
use strategy::{RequestTraits, RoutingStrategy, Selector};

/// Which [`Provider`] implementation backs a configured endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
    /// Offline backend for development.
    Echo,
}

/// Static description of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Model names or trailing-`*` patterns served. Empty serves everything.
    #[serde(default)]
    pub models: Vec<String>,
    /// Task tags this endpoint is suited for. Empty means general purpose.
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub max_context_tokens: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// USD per million prompt tokens.
    #[serde(default)]
    pub input_price_per_mtok: f64,
    /// USD per million completion tokens.
    #[serde(default)]
    pub output_price_per_mtok: f64,
}

fn default_weight() -> u32 {
    1
}

impl ProviderEndpointConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::default(),
            base_url: None,
            api_key_env: None,
            weight: default_weight(),
            models: Vec::new(),
            tasks: Vec::new(),
            max_context_tokens: None,
            timeout_ms: None,
            input_price_per_mtok: 0.0,
            output_price_per_mtok: 0.0,
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_prices(mut self, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        self.input_price_per_mtok = input_per_mtok;
        self.output_price_per_mtok = output_per_mtok;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Build the provider this config describes.
    pub fn build_provider(&self) -> Result<Arc<dyn Provider>, ConfigError> {
        match self.kind {
            ProviderKind::Echo => Ok(Arc::new(EchoProvider::new(&self.name))),
            ProviderKind::OpenaiCompatible => {
                let base_url = self.base_url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid(format!("provider '{}' needs a base_url", self.name))
                })?;
                Ok(match &self.api_key_env {
                    Some(env) => Arc::new(HttpProvider::from_env(&self.name, base_url, env)),
                    None => Arc::new(HttpProvider::new(&self.name, base_url, None)),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,
    /// Endpoint names in fallback order. Unlisted endpoints follow in
    /// declaration order.
    pub fallback_chain: Vec<String>,
    /// Overall budget for the whole chain.
    pub request_deadline_ms: u64,
    /// Per-attempt timeout for endpoints without their own.
    pub provider_timeout_ms: u64,
    /// Extra attempts on the same endpoint for transient errors.
    pub retries_per_provider: u32,
    pub retry_base_delay_ms: u64,
    /// Seconds between health probes; 0 disables probing.
    pub health_probe_interval_secs: u64,
    pub breaker: BreakerConfig,
    pub providers: Vec<ProviderEndpointConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::RoundRobin,
            fallback_chain: Vec::new(),
            request_deadline_ms: 30_000,
            provider_timeout_ms: 10_000,
            retries_per_provider: 0,
            retry_base_delay_ms: 100,
            health_probe_interval_secs: 30,
            breaker: BreakerConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

/// Exponential backoff with up to 25% random jitter.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exp = 2u32.saturating_pow(attempt);
    let capped = base.saturating_mul(exp).min(max);
    let jitter_max = capped.as_millis() as u64 / 4;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..=jitter_max)
    } else {
        0
    };
    capped + Duration::from_millis(jitter)
}

fn model_served(patterns: &[String], model: &str) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => p == model,
        })
}

/// Runtime state of one configured backend.
pub struct Endpoint {
    id: usize,
    config: ProviderEndpointConfig,
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
    in_flight: AtomicU64,
    /// f64 bits of the latency EWMA in ms; NaN until the first success.
    latency_ewma: AtomicU64,
}

/// Decrements the in-flight counter when the call ends.
pub struct InFlight<'a>(&'a AtomicU64);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

const LATENCY_ALPHA: f64 = 0.2;

impl Endpoint {
    pub fn new(
        id: usize,
        config: ProviderEndpointConfig,
        provider: Arc<dyn Provider>,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            id,
            breaker: CircuitBreaker::new(config.name.clone(), breaker),
            config,
            provider,
            in_flight: AtomicU64::new(0),
            latency_ewma: AtomicU64::new(f64::NAN.to_bits()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn max_context_tokens(&self) -> Option<u64> {
        self.config.max_context_tokens
    }

    pub fn supports_task(&self, task: &str) -> bool {
        self.config.tasks.is_empty() || self.config.tasks.iter().any(|t| t == task)
    }

    pub fn serves_model(&self, model: &str) -> bool {
        model_served(&self.config.models, model)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_call(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(&self.in_flight)
    }

    /// Moving average of successful call latency; 0 before any sample so
    /// new endpoints get tried.
    pub fn latency_ewma_ms(&self) -> f64 {
        let v = f64::from_bits(self.latency_ewma.load(Ordering::Relaxed));
        if v.is_nan() {
            0.0
        } else {
            v
        }
    }

    pub fn record_latency(&self, sample_ms: f64) {
        let _ = self
            .latency_ewma
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let prev = f64::from_bits(bits);
                let next = if prev.is_nan() {
                    sample_ms
                } else {
                    LATENCY_ALPHA * sample_ms + (1.0 - LATENCY_ALPHA) * prev
                };
                Some(next.to_bits())
            });
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.config.timeout_ms.map_or(default, Duration::from_millis)
    }

    /// USD cost of a call with the given usage.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.config.input_price_per_mtok
            + completion_tokens as f64 * self.config.output_price_per_mtok)
            / 1_000_000.0
    }

    pub fn snapshot(&self) -> ProviderEndpoint {
        let b = self.breaker.snapshot();
        let ewma = f64::from_bits(self.latency_ewma.load(Ordering::Relaxed));
        ProviderEndpoint {
            name: self.config.name.clone(),
            weight: self.config.weight,
            capabilities: self
                .config
                .models
                .iter()
                .chain(self.config.tasks.iter())
                .cloned()
                .collect(),
            health_state: b.state,
            consecutive_failures: b.consecutive_failures,
            last_state_change: b.last_state_change,
            in_flight: self.in_flight(),
            latency_ewma_ms: (!ewma.is_nan()).then_some(ewma),
        }
    }
}

/// Operator view of an endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub weight: u32,
    pub capabilities: BTreeSet<String>,
    pub health_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_state_change: DateTime<Utc>,
    pub in_flight: u64,
    pub latency_ewma_ms: Option<f64>,
}

/// Everything the router needs to place one call.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub request_id: String,
    pub model: String,
    /// Redacted payload.
    pub payload: String,
    /// Redacted messages, roles preserved.
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub task_type: Option<String>,
    pub estimated_tokens: u64,
    /// Models the policy allows; empty means no extra restriction.
    pub allowed_models: BTreeSet<String>,
}

/// How the successful call was placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub chosen_provider: String,
    pub strategy_used: RoutingStrategy,
    /// Zero-based position of the chosen endpoint in the candidate chain.
    pub fallback_chain_position: usize,
    pub latency_ms: u64,
}

/// One step of the chain walk, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAttempt {
    pub provider: String,
    /// `ok`, `skipped_open`, or a provider error kind.
    pub outcome: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RoutedCall {
    pub output: ProviderOutput,
    pub decision: RoutingDecision,
    /// USD.
    pub cost: f64,
    pub attempts: Vec<RouteAttempt>,
}

#[derive(Debug, Clone)]
pub struct RouteFailure {
    pub error: GatewayError,
    pub attempts: Vec<RouteAttempt>,
}

pub struct ModelRouter {
    config: RouterConfig,
    endpoints: Vec<Arc<Endpoint>>,
    /// Endpoint ids in fallback order.
    fallback_order: Vec<usize>,
    selector: Selector,
}

impl ModelRouter {
    /// Build from the configured endpoints plus any programmatic ones.
    pub fn from_config(
        config: RouterConfig,
        extra: Vec<(ProviderEndpointConfig, Arc<dyn Provider>)>,
    ) -> Result<Self, ConfigError> {
        let mut backends = Vec::with_capacity(config.providers.len() + extra.len());
        for endpoint in &config.providers {
            backends.push((endpoint.clone(), endpoint.build_provider()?));
        }
        backends.extend(extra);
        Self::new(config, backends)
    }

    pub fn new(
        config: RouterConfig,
        backends: Vec<(ProviderEndpointConfig, Arc<dyn Provider>)>,
    ) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::Invalid("no providers configured".into()));
        }
        let mut names = BTreeSet::new();
        for (endpoint, _) in &backends {
            if !names.insert(endpoint.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name '{}'",
                    endpoint.name
                )));
            }
        }

        let endpoints: Vec<Arc<Endpoint>> = backends
            .into_iter()
            .enumerate()
            .map(|(id, (cfg, provider))| {
                Arc::new(Endpoint::new(id, cfg, provider, config.breaker.clone()))
            })
            .collect();

        let mut fallback_order = Vec::with_capacity(endpoints.len());
        for name in &config.fallback_chain {
            let endpoint = endpoints
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| ConfigError::UnknownProvider(name.clone()))?;
            if !fallback_order.contains(&endpoint.id()) {
                fallback_order.push(endpoint.id());
            }
        }
        for endpoint in &endpoints {
            if !fallback_order.contains(&endpoint.id()) {
                fallback_order.push(endpoint.id());
            }
        }

        info!(
            strategy = %config.strategy,
            endpoints = endpoints.len(),
            chain = ?fallback_order.iter().map(|&i| endpoints[i].name()).collect::<Vec<_>>(),
            "model router ready"
        );

        Ok(Self {
            selector: Selector::new(config.strategy, endpoints.len()),
            config,
            endpoints,
            fallback_order,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn endpoint_snapshots(&self) -> Vec<ProviderEndpoint> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }

    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    /// Upper-bound cost of a call, using the most expensive endpoint that
    /// serves `model`.
    pub fn estimate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.endpoints
            .iter()
            .filter(|e| e.serves_model(model))
            .map(|e| e.cost(prompt_tokens, completion_tokens))
            .fold(0.0, f64::max)
    }

    /// Strategy pick first, then the remaining endpoints in fallback order.
    pub fn candidate_chain(&self, request: &RouteRequest) -> Vec<Arc<Endpoint>> {
        let serving: Vec<Arc<Endpoint>> = self
            .fallback_order
            .iter()
            .map(|&i| Arc::clone(&self.endpoints[i]))
            .filter(|e| e.serves_model(&request.model))
            .collect();
        if serving.is_empty() {
            return serving;
        }

        let available: Vec<Arc<Endpoint>> = serving
            .iter()
            .filter(|e| e.breaker().is_available())
            .cloned()
            .collect();
        let pool = if available.is_empty() { &serving } else { &available };
        let traits = RequestTraits {
            task_type: request.task_type.as_deref(),
            estimated_tokens: request.estimated_tokens,
        };
        let Some(first) = self.selector.pick(pool, traits).map(|i| Arc::clone(&pool[i])) else {
            return serving;
        };

        let mut chain = Vec::with_capacity(serving.len());
        chain.push(Arc::clone(&first));
        chain.extend(serving.into_iter().filter(|e| e.id() != first.id()));
        chain
    }

    /// Select an endpoint and execute the call with timeout, retry and
    /// fallback, all bounded by `deadline`.
    pub async fn route_and_call(
        &self,
        request: &RouteRequest,
        deadline: Instant,
    ) -> Result<RoutedCall, RouteFailure> {
        let mut attempts = Vec::new();

        if !request.allowed_models.is_empty() && !request.allowed_models.contains(&request.model) {
            return Err(RouteFailure {
                error: GatewayError::PolicyDenied(format!(
                    "model '{}' outside the allowed set",
                    request.model
                )),
                attempts,
            });
        }

        let chain = self.candidate_chain(request);
        if chain.is_empty() {
            return Err(RouteFailure {
                error: GatewayError::AllProvidersUnavailable(format!(
                    "no endpoint serves model '{}'",
                    request.model
                )),
                attempts,
            });
        }

        let default_timeout = Duration::from_millis(self.config.provider_timeout_ms);
        let retry_base = Duration::from_millis(self.config.retry_base_delay_ms);
        let mut deadline_hit = false;

        'chain: for (position, endpoint) in chain.iter().enumerate() {
            let mut retry = 0;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    deadline_hit = true;
                    break 'chain;
                }
                let Some(permit) = endpoint.breaker().try_acquire() else {
                    debug!(request_id = %request.request_id, provider = endpoint.name(), "breaker open, skipping");
                    attempts.push(RouteAttempt {
                        provider: endpoint.name().to_string(),
                        outcome: "skipped_open".into(),
                        latency_ms: 0,
                    });
                    metrics::counter!(
                        crate::telemetry::PROVIDER_CALLS_TOTAL,
                        "provider" => endpoint.name().to_string(),
                        "outcome" => "skipped_open"
                    )
                    .increment(1);
                    continue 'chain;
                };

                let budget = endpoint.timeout(default_timeout).min(deadline - now);
                let call = ProviderRequest {
                    request_id: request.request_id.clone(),
                    model: request.model.clone(),
                    payload: request.payload.clone(),
                    messages: request.messages.clone(),
                    max_tokens: request.max_tokens,
                    temperature: request.temperature,
                    timeout: budget,
                };

                let started = Instant::now();
                let result = {
                    let _in_flight = endpoint.begin_call();
                    match tokio::time::timeout(budget, endpoint.provider.generate(&call)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout(budget)),
                    }
                };
                let latency_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(output) => {
                        endpoint.breaker().on_success(permit);
                        endpoint.record_latency(latency_ms as f64);
                        metrics::counter!(
                            crate::telemetry::PROVIDER_CALLS_TOTAL,
                            "provider" => endpoint.name().to_string(),
                            "outcome" => "ok"
                        )
                        .increment(1);
                        attempts.push(RouteAttempt {
                            provider: endpoint.name().to_string(),
                            outcome: "ok".into(),
                            latency_ms,
                        });
                        let cost = endpoint.cost(output.prompt_tokens, output.completion_tokens);
                        debug!(
                            request_id = %request.request_id,
                            provider = endpoint.name(),
                            position,
                            latency_ms,
                            "provider call succeeded"
                        );
                        return Ok(RoutedCall {
                            output,
                            decision: RoutingDecision {
                                chosen_provider: endpoint.name().to_string(),
                                strategy_used: self.selector.strategy(),
                                fallback_chain_position: position,
                                latency_ms,
                            },
                            cost,
                            attempts,
                        });
                    }
                    Err(err) => {
                        if err.counts_against_health() {
                            endpoint.breaker().on_failure(permit);
                        } else {
                            endpoint.breaker().release(permit);
                        }
                        metrics::counter!(
                            crate::telemetry::PROVIDER_CALLS_TOTAL,
                            "provider" => endpoint.name().to_string(),
                            "outcome" => err.kind()
                        )
                        .increment(1);
                        attempts.push(RouteAttempt {
                            provider: endpoint.name().to_string(),
                            outcome: err.kind().to_string(),
                            latency_ms,
                        });
                        warn!(
                            request_id = %request.request_id,
                            provider = endpoint.name(),
                            position,
                            chain_len = chain.len(),
                            error = %err,
                            "provider call failed"
                        );

                        if err.is_retryable() && retry < self.config.retries_per_provider {
                            let pause = backoff_delay(retry_base, retry, Duration::from_secs(5));
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if pause < remaining {
                                tokio::time::sleep(pause).await;
                                retry += 1;
                                continue;
                            }
                        }
                        continue 'chain;
                    }
                }
            }
        }

        let error = if deadline_hit || Instant::now() >= deadline {
            GatewayError::ProviderTimeout(format!(
                "request deadline exceeded after {} attempt(s)",
                attempts.len()
            ))
        } else {
            GatewayError::AllProvidersUnavailable(format!(
                "{} candidate(s) failed or open",
                chain.len()
            ))
        };
        Err(RouteFailure { error, attempts })
    }

    /// Probe every endpoint that is not cooling down and feed the result
    /// to its breaker. Returns `(name, healthy)` for each probed endpoint.
    pub async fn probe_health(&self) -> Vec<(String, bool)> {
        let probes = self.endpoints.iter().filter_map(|endpoint| {
            let permit = endpoint.breaker().try_acquire()?;
            Some(async move {
                let probe =
                    tokio::time::timeout(Duration::from_secs(5), endpoint.provider.health_check())
                        .await;
                let healthy = matches!(probe, Ok(Ok(())));
                match probe {
                    Ok(Ok(())) => endpoint.breaker().on_success(permit),
                    Ok(Err(e)) if !e.counts_against_health() => endpoint.breaker().release(permit),
                    _ => endpoint.breaker().on_failure(permit),
                }
                if !healthy {
                    warn!(provider = endpoint.name(), "health probe failed");
                }
                (endpoint.name().to_string(), healthy)
            })
        });
        futures::future::join_all(probes).await
    }

    /// Run [`ModelRouter::probe_health`] on a fixed interval.
    pub fn spawn_health_probe(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                router.probe_health().await;
            }
        })
    }
}
