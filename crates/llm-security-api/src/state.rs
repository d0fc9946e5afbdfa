//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use llm_security_core::SecurityGateway;
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SecurityGateway>,
    /// Present when the Prometheus recorder was installed.
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(gateway: Arc<SecurityGateway>) -> Self {
        Self {
            gateway,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
