//! Breaker, deadline, cancellation and durable audit behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use llm_security_core::audit::{
    verify_chain, AuditSinkKind, JsonlFileAuditSink, MemoryAuditSink,
};
use llm_security_core::router::breaker::CircuitState;
use llm_security_core::router::strategy::RoutingStrategy;
use llm_security_core::{ErrorCode, FinalStatus, InboundRequest, Principal, Tier};
use tokio_util::sync::CancellationToken;

use common::{builder, config, endpoint, token_for, RecordingProvider};

fn breaker_config() -> llm_security_core::GatewayConfig {
    let mut config = config();
    config.router.strategy = RoutingStrategy::LeastConnections;
    config.router.fallback_chain = vec!["primary".into(), "backup".into()];
    config.router.breaker.failure_threshold = 2;
    config.router.breaker.cool_down_ms = 1_000;
    config.router.breaker.half_open_max_trials = 1;
    config
}

#[tokio::test(start_paused = true)]
async fn open_breaker_is_skipped_until_cool_down() {
    let sink = MemoryAuditSink::new();
    let primary = RecordingProvider::new("primary");
    let backup = RecordingProvider::new("backup");
    primary.set_failing(true);
    let gateway = builder(breaker_config(), &sink)
        .with_provider(endpoint("primary"), primary.clone())
        .with_provider(endpoint("backup"), backup.clone())
        .build()
        .await
        .unwrap();

    let principal = Principal::new("user-1", "tenant-a", Tier::Enterprise);
    let token = token_for(&principal);
    let call = || InboundRequest::chat(token.clone(), "gpt-4", "hello");

    // Two failures open the primary; the backup answers both times.
    for _ in 0..2 {
        let response = gateway.process(call()).await.unwrap();
        assert!(response.content.starts_with("backup"));
    }
    let primary_state = gateway.router().endpoint("primary").unwrap().breaker().state();
    assert_eq!(primary_state, CircuitState::Open);
    assert_eq!(primary.calls(), 2);

    // While cooling down the primary is not contacted at all.
    gateway.process(call()).await.unwrap();
    assert_eq!(primary.calls(), 2);
    assert_eq!(backup.calls(), 3);

    // After the cool-down exactly one trial reaches the primary.
    tokio::time::advance(Duration::from_millis(1_001)).await;
    gateway.process(call()).await.unwrap();
    assert_eq!(primary.calls(), 3);
    gateway.process(call()).await.unwrap();
    assert_eq!(primary.calls(), 3);

    // A successful trial closes it again.
    primary.set_failing(false);
    tokio::time::advance(Duration::from_millis(1_001)).await;
    let response = gateway.process(call()).await.unwrap();
    assert!(response.content.starts_with("primary"));
    assert_eq!(
        gateway.router().endpoint("primary").unwrap().breaker().state(),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn every_provider_open_is_reported_unavailable() {
    let sink = MemoryAuditSink::new();
    let primary = RecordingProvider::new("primary");
    let backup = RecordingProvider::new("backup");
    primary.set_failing(true);
    backup.set_failing(true);
    let gateway = builder(breaker_config(), &sink)
        .with_provider(endpoint("primary"), primary.clone())
        .with_provider(endpoint("backup"), backup.clone())
        .build()
        .await
        .unwrap();

    let principal = Principal::new("user-1", "tenant-a", Tier::Enterprise);
    let token = token_for(&principal);
    for _ in 0..3 {
        let err = gateway
            .process(InboundRequest::chat(token.clone(), "gpt-4", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AllProvidersUnavailable);
    }
    // Third request found both breakers open and made no calls.
    assert_eq!(primary.calls(), 2);
    assert_eq!(backup.calls(), 2);
    assert!(!gateway.health().is_ready());

    assert!(gateway.audit().wait_idle(Duration::from_secs(1)).await);
    assert!(sink
        .records()
        .iter()
        .all(|r| r.final_status == FinalStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_a_slow_provider() {
    let sink = MemoryAuditSink::new();
    let mut config = config();
    config.router.request_deadline_ms = 500;
    let slow = RecordingProvider::with_delay("slow", Duration::from_secs(5));
    let gateway = builder(config, &sink)
        .with_provider(endpoint("slow"), slow)
        .build()
        .await
        .unwrap();

    let principal = Principal::new("user-1", "tenant-a", Tier::Free);
    let started = tokio::time::Instant::now();
    let mut inbound = InboundRequest::chat(token_for(&principal), "gpt-3.5-turbo", "hello");
    inbound.correlation_id = Some("slow-1".into());
    let err = gateway.process(inbound).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ProviderTimeout);
    assert!(started.elapsed() <= Duration::from_millis(600));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(gateway.audit().wait_idle(Duration::from_secs(1)).await);
    let records = sink.records_correlated("slow-1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_status, FinalStatus::Cancelled);
    assert_eq!(records[0].status_detail.as_deref(), Some("route:deadline"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_expiry_is_always_audited_as_cancelled() {
    let sink = MemoryAuditSink::new();
    let mut config = config();
    config.router.request_deadline_ms = 20;
    let slow = RecordingProvider::with_delay("slow", Duration::from_millis(200));
    let gateway = Arc::new(
        builder(config, &sink)
            .with_provider(endpoint("slow"), slow)
            .build()
            .await
            .unwrap(),
    );

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let gateway = Arc::clone(&gateway);
            let principal = Principal::new(format!("user-{i}"), "tenant-a", Tier::Free);
            let inbound = InboundRequest::chat(token_for(&principal), "gpt-3.5-turbo", "hello");
            tokio::spawn(async move { gateway.process(inbound).await })
        })
        .collect();
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProviderTimeout);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(gateway.audit().wait_idle(Duration::from_secs(2)).await);
    let records = sink.records();
    assert_eq!(records.len(), 16);
    for record in &records {
        assert_eq!(record.final_status, FinalStatus::Cancelled, "{:?}", record.status_detail);
        assert!(record
            .status_detail
            .as_deref()
            .is_some_and(|d| d.ends_with(":deadline")));
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_still_records_the_late_provider_cost() {
    let sink = MemoryAuditSink::new();
    let provider = RecordingProvider::with_delay("primary", Duration::from_secs(2));
    let gateway = Arc::new(
        builder(config(), &sink)
            .with_provider(endpoint("primary"), provider.clone())
            .build()
            .await
            .unwrap(),
    );

    let principal = Principal::new("user-1", "tenant-a", Tier::Free);
    let mut inbound = InboundRequest::chat(token_for(&principal), "gpt-3.5-turbo", "hello");
    inbound.correlation_id = Some("gone-1".into());

    let cancel = CancellationToken::new();
    let task = {
        let gateway = Arc::clone(&gateway);
        let cancel = cancel.clone();
        tokio::spawn(async move { gateway.process_with_cancel(inbound, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(provider.calls(), 1);

    // Nothing is flushed while the provider call is still out.
    assert!(sink.records_correlated("gone-1").is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(gateway.audit().wait_idle(Duration::from_secs(1)).await);
    let records = sink.records_correlated("gone-1");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.final_status, FinalStatus::Cancelled);
    assert_eq!(record.stage("provider_call").unwrap().outcome, "ok");
    assert!(record.cost > 0.0);
    assert_eq!(record.routing.as_ref().unwrap().chosen_provider, "primary");
}

#[tokio::test]
async fn jsonl_audit_log_is_hash_chained() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let mut config = config();
    config.audit.sink = AuditSinkKind::Jsonl;
    config.audit.path = Some(path.clone());
    let gateway = builder_with_configured_sink(config)
        .with_provider(endpoint("primary"), RecordingProvider::new("primary"))
        .build()
        .await
        .unwrap();

    let principal = Principal::new("user-1", "tenant-a", Tier::Free);
    let token = token_for(&principal);
    for prompt in ["one", "two", "my card is 4111 1111 1111 1111"] {
        gateway
            .process(InboundRequest::chat(token.clone(), "gpt-3.5-turbo", prompt))
            .await
            .unwrap();
    }
    assert!(gateway.audit().wait_idle(Duration::from_secs(5)).await);

    assert_eq!(verify_chain(&path).unwrap(), 3);
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("4111 1111 1111 1111"));

    // Reopening continues the chain from the last hash.
    drop(gateway);
    let reopened = JsonlFileAuditSink::open(&path).unwrap();
    assert_eq!(reopened.path(), path.as_path());
}

fn builder_with_configured_sink(
    config: llm_security_core::GatewayConfig,
) -> llm_security_core::SecurityGatewayBuilder {
    llm_security_core::SecurityGateway::builder()
        .with_config(config)
        .without_background_tasks()
}
