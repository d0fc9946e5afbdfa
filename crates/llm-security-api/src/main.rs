//! LLM Security Gateway server

use std::sync::Arc;

use anyhow::Context;
use llm_security_api::{create_router, telemetry, AppState, Settings};
use llm_security_core::SecurityGateway;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    telemetry::init_tracing(&settings.server.log_format);

    let gateway = SecurityGateway::builder()
        .with_config(settings.gateway.clone())
        .build()
        .await
        .context("failed to build security gateway")?;

    let mut state = AppState::new(Arc::new(gateway));
    if settings.server.metrics_enabled {
        match telemetry::install_metrics() {
            Ok(handle) => state = state.with_metrics(handle),
            Err(e) => warn!(error = %e, "prometheus recorder not installed"),
        }
    }

    let app = create_router(state.clone(), &settings.server);

    // Bind server (respect PORT env for Cloud Run, default to 8080)
    let addr = format!("0.0.0.0:{}", settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "LLM security gateway listening");
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight audit records reach the sink before exiting.
    if !state.gateway.audit().wait_idle(std::time::Duration::from_secs(5)).await {
        warn!(pending = state.gateway.audit().health().pending, "audit records still pending at shutdown");
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}
