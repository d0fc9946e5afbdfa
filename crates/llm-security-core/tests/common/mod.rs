#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use llm_security_core::audit::MemoryAuditSink;
use llm_security_core::router::provider::{Provider, ProviderError, ProviderOutput, ProviderRequest};
use llm_security_core::router::ProviderEndpointConfig;
use llm_security_core::{
    ChatMessage, GatewayConfig, HmacIdentityResolver, Principal, SecurityGateway, SecurityGatewayBuilder,
};

pub const SECRET: &str = "integration-secret";

/// Backend that records every prompt it receives and can be switched
/// between healthy and failing.
pub struct RecordingProvider {
    name: String,
    failing: AtomicBool,
    delay: Duration,
    calls: AtomicU64,
    prompts: std::sync::Mutex<Vec<String>>,
    requests: std::sync::Mutex<Vec<(Vec<ChatMessage>, Option<f32>)>>,
}

impl RecordingProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_delay(name, Duration::ZERO)
    }

    pub fn with_delay(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: AtomicBool::new(false),
            delay,
            calls: AtomicU64::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Messages and temperature of every call, in order.
    pub fn requests(&self) -> Vec<(Vec<ChatMessage>, Option<f32>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.payload.clone());
        self.requests
            .lock()
            .unwrap()
            .push((request.messages.clone(), request.temperature));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Server { status: 503 });
        }
        Ok(ProviderOutput {
            text: format!("{} says: ok", self.name),
            prompt_tokens: 10,
            completion_tokens: 5,
        })
    }
}

pub fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.identity.shared_secret = SECRET.to_string();
    config
}

pub fn builder(config: GatewayConfig, sink: &MemoryAuditSink) -> SecurityGatewayBuilder {
    SecurityGateway::builder()
        .with_config(config)
        .with_audit_sink(Arc::new(sink.clone()))
        .without_background_tasks()
}

pub fn endpoint(name: &str) -> ProviderEndpointConfig {
    ProviderEndpointConfig::named(name).with_prices(1.0, 2.0)
}

pub fn token_for(principal: &Principal) -> String {
    HmacIdentityResolver::new(SECRET).issue(principal).unwrap()
}
