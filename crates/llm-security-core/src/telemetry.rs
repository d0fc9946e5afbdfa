//! Metric names and recording helpers.
//!
//! Metrics go through the `metrics` facade; the API binary installs the
//! Prometheus recorder. Without a recorder every call is a no-op.

use std::time::Duration;

use crate::error::ErrorCode;

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const REJECTIONS_TOTAL: &str = "gateway_rejections_total";
pub const REQUEST_DURATION_MS: &str = "gateway_request_duration_ms";
pub const PROVIDER_CALLS_TOTAL: &str = "gateway_provider_calls_total";
pub const BREAKER_TRANSITIONS_TOTAL: &str = "gateway_breaker_transitions_total";
pub const QUOTA_REJECTIONS_TOTAL: &str = "gateway_quota_rejections_total";
pub const AUDIT_SINK_FAILURES_TOTAL: &str = "gateway_audit_sink_failures_total";
pub const PII_FINDINGS_TOTAL: &str = "gateway_pii_findings_total";

/// Count one finished request and its latency.
pub fn record_request(status: &'static str, elapsed: Duration) {
    metrics::counter!(REQUESTS_TOTAL, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_MS, "status" => status)
        .record(elapsed.as_secs_f64() * 1_000.0);
}

pub fn record_rejection(code: ErrorCode) {
    metrics::counter!(REJECTIONS_TOTAL, "code" => code.as_str()).increment(1);
}

pub fn record_pii(entity_type: &str, count: usize) {
    metrics::counter!(PII_FINDINGS_TOTAL, "entity" => entity_type.to_string())
        .increment(count as u64);
}

/// Metric names with their help text, for exporters that describe them.
pub fn describe() {
    metrics::describe_counter!(REQUESTS_TOTAL, "Requests that reached a terminal state");
    metrics::describe_counter!(REJECTIONS_TOTAL, "Requests rejected or failed, by error code");
    metrics::describe_histogram!(
        REQUEST_DURATION_MS,
        metrics::Unit::Milliseconds,
        "End-to-end pipeline latency"
    );
    metrics::describe_counter!(PROVIDER_CALLS_TOTAL, "Provider attempts by outcome");
    metrics::describe_counter!(BREAKER_TRANSITIONS_TOTAL, "Circuit breaker state changes");
    metrics::describe_counter!(QUOTA_REJECTIONS_TOTAL, "Quota admissions refused, by dimension");
    metrics::describe_counter!(AUDIT_SINK_FAILURES_TOTAL, "Audit deliveries that failed or were dropped");
    metrics::describe_counter!(PII_FINDINGS_TOTAL, "Redacted PII findings by entity type");
}
