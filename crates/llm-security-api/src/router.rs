//! Route configuration

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::handlers;
use crate::middleware::request_id_middleware;
use crate::settings::ServerSettings;
use crate::state::AppState;

/// Create the application router
///
/// ## Routes
/// - POST /v1/chat/completions - Run a request through the gateway
/// - GET /v1/providers - Provider endpoint and breaker states
/// - GET /health - Basic health check
/// - GET /health/ready - Readiness probe (providers and audit sink)
/// - GET /health/live - Liveness probe
/// - GET /version - Version information
/// - GET /metrics - Prometheus exposition
pub fn create_router(state: AppState, server: &ServerSettings) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/providers", get(handlers::providers))
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::ready))
        .route("/health/live", get(handlers::live))
        .route("/version", get(handlers::version))
        .route("/metrics", get(handlers::metrics))
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .layer(cors_layer(&server.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
