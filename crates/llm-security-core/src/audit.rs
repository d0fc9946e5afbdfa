//! Per-request audit trail and durable delivery.
//!
//! The orchestrator opens one [`AuditTrail`] per request. Stages append
//! [`StageOutcome`]s to it; `finalize` seals it with a [`FinalStatus`].
//! The finished [`AuditRecord`] is handed to the [`AuditRecorder`]'s
//! dispatcher exactly once, when the last holder of the trail lets go.
//! A trail dropped without `finalize` (caller disconnect, panic) seals
//! itself as `cancelled` or `failed`.
//!
//! Delivery to the [`AuditSink`] is asynchronous. A failing sink is
//! retried with exponential backoff while records queue in a bounded
//! buffer; sustained failure is counted, logged at `error` and reported
//! through [`AuditRecorder::health`].

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::router::{backoff_delay, RoutingDecision};
use crate::types::Principal;

/// Errors that can occur while persisting audit records.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Hash chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },
}

/// Terminal state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    Rejected,
    Failed,
    Cancelled,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Completed => "completed",
            FinalStatus::Rejected => "rejected",
            FinalStatus::Failed => "failed",
            FinalStatus::Cancelled => "cancelled",
        }
    }
}

/// One stage's contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub outcome: String,
    #[serde(default)]
    pub metadata: Value,
    pub at: DateTime<Utc>,
}

/// The durable record of everything that happened to one request.
///
/// Never carries raw payload text or matched PII; only entity types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Generated by the gateway; unique per request.
    pub request_id: String,
    /// Caller-supplied id, echoed for log correlation only.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub principal_id: Option<String>,
    pub tenant_id: Option<String>,
    pub target_model: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub stage_outcomes: Vec<StageOutcome>,
    pub final_status: FinalStatus,
    /// Stage or error code that ended the request, when not completed.
    pub status_detail: Option<String>,
    /// USD.
    pub cost: f64,
    pub duration_ms: u64,
    pub pii_detected: bool,
    pub pii_entities: Vec<String>,
    pub flagged_for_review: bool,
    pub routing: Option<RoutingDecision>,
}

impl AuditRecord {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stage_outcomes.iter().find(|s| s.stage == name)
    }
}

/// Append-only destination for finalized records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;

    async fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let stages: Vec<String> = record
            .stage_outcomes
            .iter()
            .map(|s| format!("{}={}", s.stage, s.outcome))
            .collect();
        match record.final_status {
            FinalStatus::Completed => info!(
                target: "audit",
                request_id = %record.request_id,
                principal_id = ?record.principal_id,
                final_status = record.final_status.as_str(),
                stages = ?stages,
                pii_entities = ?record.pii_entities,
                flagged_for_review = record.flagged_for_review,
                cost = record.cost,
                duration_ms = record.duration_ms,
                "audit record"
            ),
            _ => warn!(
                target: "audit",
                request_id = %record.request_id,
                principal_id = ?record.principal_id,
                final_status = record.final_status.as_str(),
                status_detail = ?record.status_detail,
                stages = ?stages,
                cost = record.cost,
                duration_ms = record.duration_ms,
                "audit record"
            ),
        }
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and local development.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn records_for(&self, request_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }

    pub fn records_correlated(&self, correlation_id: &str) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.correlation_id.as_deref() == Some(correlation_id))
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(record.clone());
        Ok(())
    }
}

const GENESIS_HASH: &str = "0";

#[derive(Serialize)]
struct ChainLine<'a> {
    prev_hash: &'a str,
    hash: &'a str,
    record: &'a RawValue,
}

#[derive(Deserialize)]
struct ChainLineOwned<'a> {
    prev_hash: String,
    hash: String,
    #[serde(borrow)]
    record: &'a RawValue,
}

fn chain_hash(prev_hash: &str, record_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(record_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append handle on the chain file.
#[async_trait]
trait ChainFile: Send {
    /// Write and flush one complete line.
    async fn append(&mut self, line: &[u8]) -> std::io::Result<()>;

    async fn size(&mut self) -> std::io::Result<u64>;

    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait]
impl ChainFile for tokio::fs::File {
    async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.write_all(line).await?;
        self.flush().await
    }

    async fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await
    }
}

struct ChainState {
    file: Option<Box<dyn ChainFile>>,
    last_hash: String,
    /// File length up to the end of the last fully written line.
    committed_len: u64,
}

/// Append-only JSON lines file where every line carries the SHA-256 of
/// the previous line's hash concatenated with its own record.
pub struct JsonlFileAuditSink {
    path: PathBuf,
    state: tokio::sync::Mutex<ChainState>,
}

impl JsonlFileAuditSink {
    /// Open or create the log, resuming the chain from its last line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (last_hash, committed_len) = match std::fs::File::open(&path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                (last_hash_in(BufReader::new(file))?, len)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (GENESIS_HASH.to_string(), 0),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(ChainState {
                file: None,
                last_hash,
                committed_len,
            }),
        })
    }

    async fn open_file(&self) -> Result<Box<dyn ChainFile>, AuditError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_hash_in(reader: impl BufRead) -> Result<String, AuditError> {
    let mut last = GENESIS_HASH.to_string();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ChainLineOwned<'_> =
            serde_json::from_str(&line).map_err(|e| AuditError::ChainBroken {
                line: i + 1,
                reason: e.to_string(),
            })?;
        last = parsed.hash;
    }
    Ok(last)
}

#[async_trait]
impl AuditSink for JsonlFileAuditSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let record_json = serde_json::to_string(record)?;
        let raw = RawValue::from_string(record_json)?;

        let mut state = self.state.lock().await;
        let mut file = match state.file.take() {
            Some(file) => file,
            None => {
                let mut file = self.open_file().await?;
                // A line left behind by an earlier failed write.
                if file.size().await? > state.committed_len {
                    warn!(path = %self.path.display(), "truncating partial audit line");
                    file.truncate(state.committed_len).await?;
                }
                file
            }
        };

        let hash = chain_hash(&state.last_hash, raw.get());
        let mut line = serde_json::to_string(&ChainLine {
            prev_hash: &state.last_hash,
            hash: &hash,
            record: &raw,
        })?;
        line.push('\n');

        match file.append(line.as_bytes()).await {
            Ok(()) => {
                state.committed_len += line.len() as u64;
                state.last_hash = hash;
                state.file = Some(file);
                Ok(())
            }
            Err(e) => {
                // Roll back whatever reached the file so the retry extends
                // the chain from the same head. If that fails too, the
                // next write truncates after reopening.
                if let Err(te) = file.truncate(state.committed_len).await {
                    warn!(path = %self.path.display(), error = %te, "audit rollback failed");
                }
                Err(e.into())
            }
        }
    }
}

/// Check every link of a hash-chained log. Returns the number of records.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut prev = GENESIS_HASH.to_string();
    let mut count = 0;
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let broken = |reason: String| AuditError::ChainBroken { line: i + 1, reason };
        let parsed: ChainLineOwned<'_> =
            serde_json::from_str(&line).map_err(|e| broken(e.to_string()))?;
        if parsed.prev_hash != prev {
            return Err(broken("prev_hash does not match preceding line".into()));
        }
        if chain_hash(&parsed.prev_hash, parsed.record.get()) != parsed.hash {
            return Err(broken("record hash mismatch".into()));
        }
        prev = parsed.hash;
        count += 1;
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSinkKind {
    #[default]
    Tracing,
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    /// Log file for the `jsonl` sink.
    pub path: Option<PathBuf>,
    /// Records held while the sink is failing before the oldest is dropped.
    pub buffer_capacity: usize,
    /// Attempts per delivery round before the sink is reported degraded.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::Tracing,
            path: None,
            buffer_capacity: 10_000,
            max_retries: 5,
            retry_base_delay_ms: 50,
        }
    }
}

impl AuditConfig {
    pub fn build_sink(&self) -> Result<Arc<dyn AuditSink>, AuditError> {
        Ok(match self.sink {
            AuditSinkKind::Tracing => Arc::new(TracingAuditSink::new()),
            AuditSinkKind::Memory => Arc::new(MemoryAuditSink::new()),
            AuditSinkKind::Jsonl => {
                let path = self
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("audit/gateway-audit.jsonl"));
                Arc::new(JsonlFileAuditSink::open(path)?)
            }
        })
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    pending: AtomicU64,
    delivered: AtomicU64,
    sink_failures: AtomicU64,
    dropped: AtomicU64,
    degraded: AtomicBool,
    idle: Notify,
}

/// Delivery counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AuditHealth {
    pub sink: String,
    pub status: &'static str,
    pub pending: u64,
    pub delivered: u64,
    pub sink_failures: u64,
    pub dropped: u64,
}

impl AuditHealth {
    pub fn is_degraded(&self) -> bool {
        self.status == "degraded"
    }
}

/// Owns the dispatcher task and opens trails.
#[derive(Clone)]
pub struct AuditRecorder {
    outbox: mpsc::UnboundedSender<AuditRecord>,
    stats: Arc<DeliveryStats>,
    sink_name: String,
}

impl AuditRecorder {
    /// Start the dispatcher on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DeliveryStats::default());
        let sink_name = sink.name().to_string();
        let dispatcher = Dispatcher {
            sink,
            rx,
            stats: Arc::clone(&stats),
            buffer: VecDeque::new(),
            capacity: config.buffer_capacity.max(1),
            max_retries: config.max_retries.max(1),
            retry_base: Duration::from_millis(config.retry_base_delay_ms),
        };
        tokio::spawn(dispatcher.run());
        info!(sink = %sink_name, "audit dispatcher started");
        Self {
            outbox: tx,
            stats,
            sink_name,
        }
    }

    /// Open the trail for a new request.
    pub fn begin(&self, request_id: impl Into<String>) -> AuditTrail {
        AuditTrail {
            shared: Arc::new(TrailShared {
                state: Mutex::new(TrailState {
                    record: AuditRecord {
                        request_id: request_id.into(),
                        correlation_id: None,
                        principal_id: None,
                        tenant_id: None,
                        target_model: None,
                        timestamp: Utc::now(),
                        stage_outcomes: Vec::new(),
                        final_status: FinalStatus::Failed,
                        status_detail: None,
                        cost: 0.0,
                        duration_ms: 0,
                        pii_detected: false,
                        pii_entities: Vec::new(),
                        flagged_for_review: false,
                        routing: None,
                    },
                    started: Instant::now(),
                    finalized: false,
                }),
                outbox: self.outbox.clone(),
                stats: Arc::clone(&self.stats),
            }),
        }
    }

    pub fn health(&self) -> AuditHealth {
        let degraded = self.stats.degraded.load(Ordering::Relaxed);
        AuditHealth {
            sink: self.sink_name.clone(),
            status: if degraded { "degraded" } else { "ok" },
            pending: self.stats.pending.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            sink_failures: self.stats.sink_failures.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Wait until every flushed record has been delivered or dropped.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.stats.idle.notified();
            if self.stats.pending.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.stats.pending.load(Ordering::Acquire) == 0;
            }
        }
    }
}

struct Dispatcher {
    sink: Arc<dyn AuditSink>,
    rx: mpsc::UnboundedReceiver<AuditRecord>,
    stats: Arc<DeliveryStats>,
    buffer: VecDeque<AuditRecord>,
    capacity: usize,
    max_retries: u32,
    retry_base: Duration,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut closed = false;
        loop {
            if self.buffer.is_empty() {
                if closed {
                    break;
                }
                match self.rx.recv().await {
                    Some(record) => self.enqueue(record),
                    None => break,
                }
            }
            closed |= self.drain_channel();
            self.deliver_front().await;
        }
        if let Err(e) = self.sink.flush().await {
            error!(sink = self.sink.name(), error = %e, "audit sink flush failed on shutdown");
        }
        debug!(sink = self.sink.name(), "audit dispatcher stopped");
    }

    /// Move queued records into the buffer. Returns `true` once every
    /// sender is gone.
    fn drain_channel(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(record) => self.enqueue(record),
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn enqueue(&mut self, record: AuditRecord) {
        if self.buffer.len() >= self.capacity {
            if let Some(oldest) = self.buffer.pop_front() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                self.finish_one();
                metrics::counter!(crate::telemetry::AUDIT_SINK_FAILURES_TOTAL, "reason" => "overflow")
                    .increment(1);
                error!(
                    request_id = %oldest.request_id,
                    capacity = self.capacity,
                    "audit buffer full, oldest record dropped"
                );
            }
        }
        self.buffer.push_back(record);
    }

    async fn deliver_front(&mut self) {
        let Some(record) = self.buffer.front().cloned() else {
            return;
        };
        let mut attempt = 0;
        loop {
            match self.sink.write(&record).await {
                Ok(()) => {
                    self.buffer.pop_front();
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if self.stats.degraded.swap(false, Ordering::Relaxed) {
                        info!(sink = self.sink.name(), "audit sink recovered");
                    }
                    self.finish_one();
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                        self.stats.degraded.store(true, Ordering::Relaxed);
                        metrics::counter!(crate::telemetry::AUDIT_SINK_FAILURES_TOTAL, "reason" => "write")
                            .increment(1);
                        error!(
                            sink = self.sink.name(),
                            request_id = %record.request_id,
                            attempts = attempt,
                            buffered = self.buffer.len(),
                            error = %e,
                            "audit sink unavailable, record kept in buffer"
                        );
                        tokio::time::sleep(backoff_delay(
                            self.retry_base,
                            attempt,
                            Duration::from_secs(5),
                        ))
                        .await;
                        return;
                    }
                    warn!(sink = self.sink.name(), attempt, error = %e, "audit write failed, retrying");
                    tokio::time::sleep(backoff_delay(
                        self.retry_base,
                        attempt - 1,
                        Duration::from_secs(5),
                    ))
                    .await;
                }
            }
        }
    }

    fn finish_one(&self) {
        self.stats.pending.fetch_sub(1, Ordering::AcqRel);
        self.stats.idle.notify_waiters();
    }
}

struct TrailState {
    record: AuditRecord,
    started: Instant,
    finalized: bool,
}

struct TrailShared {
    state: Mutex<TrailState>,
    outbox: mpsc::UnboundedSender<AuditRecord>,
    stats: Arc<DeliveryStats>,
}

impl TrailShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrailState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TrailShared {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.finalized {
            state.record.final_status = FinalStatus::Failed;
            state.record.status_detail = Some("abandoned".into());
            state.record.duration_ms = state.started.elapsed().as_millis() as u64;
        }
        let record = state.record.clone();
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.outbox.send(record) {
            self.stats.pending.fetch_sub(1, Ordering::AcqRel);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
            self.stats.degraded.store(true, Ordering::Relaxed);
            metrics::counter!(crate::telemetry::AUDIT_SINK_FAILURES_TOTAL, "reason" => "closed")
                .increment(1);
            error!(request_id = %e.0.request_id, "audit dispatcher gone, record lost");
        }
    }
}

/// The in-flight record for one request.
///
/// Owned by the orchestrator. Dropping it without [`AuditTrail::finalize`]
/// seals the record as `cancelled` (or `failed` while unwinding).
pub struct AuditTrail {
    shared: Arc<TrailShared>,
}

impl AuditTrail {
    fn update(&self, f: impl FnOnce(&mut AuditRecord)) -> Result<(), GatewayError> {
        let mut state = self.shared.lock();
        if state.finalized {
            error!(request_id = %state.record.request_id, "write to finalized audit trail");
            return Err(GatewayError::AlreadyFinalized(state.record.request_id.clone()));
        }
        f(&mut state.record);
        Ok(())
    }

    pub fn request_id(&self) -> String {
        self.shared.lock().record.request_id.clone()
    }

    /// Append one stage outcome.
    pub fn record(
        &self,
        stage: &str,
        outcome: &str,
        metadata: Value,
    ) -> Result<(), GatewayError> {
        self.update(|r| {
            r.stage_outcomes.push(StageOutcome {
                stage: stage.to_string(),
                outcome: outcome.to_string(),
                metadata,
                at: Utc::now(),
            })
        })
    }

    pub fn set_principal(&self, principal: &Principal) -> Result<(), GatewayError> {
        self.update(|r| {
            r.principal_id = Some(principal.id.clone());
            r.tenant_id = Some(principal.tenant_id.clone());
        })
    }

    pub fn set_correlation_id(&self, correlation_id: &str) -> Result<(), GatewayError> {
        self.update(|r| r.correlation_id = Some(correlation_id.to_string()))
    }

    pub fn set_target_model(&self, model: &str) -> Result<(), GatewayError> {
        self.update(|r| r.target_model = Some(model.to_string()))
    }

    /// Merge detected entity types; raw matches never reach the trail.
    pub fn add_pii_entities(&self, entities: &[String]) -> Result<(), GatewayError> {
        self.update(|r| {
            for entity in entities {
                if !r.pii_entities.contains(entity) {
                    r.pii_entities.push(entity.clone());
                }
            }
            r.pii_entities.sort();
            r.pii_detected = !r.pii_entities.is_empty();
        })
    }

    pub fn flag_for_review(&self) -> Result<(), GatewayError> {
        self.update(|r| r.flagged_for_review = true)
    }

    /// Seal the trail. Further writes fail with `AlreadyFinalized`.
    pub fn finalize(
        &self,
        status: FinalStatus,
        detail: Option<String>,
    ) -> Result<(), GatewayError> {
        let mut state = self.shared.lock();
        if state.finalized {
            error!(request_id = %state.record.request_id, "audit trail finalized twice");
            return Err(GatewayError::AlreadyFinalized(state.record.request_id.clone()));
        }
        state.finalized = true;
        state.record.final_status = status;
        state.record.status_detail = detail;
        state.record.duration_ms = state.started.elapsed().as_millis() as u64;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.shared.lock().finalized
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        self.shared.lock().record.stage(stage).is_some()
    }

    /// Reserve a slot for an outcome that may arrive after finalization,
    /// such as a provider call that cannot be aborted mid-flight. The
    /// record is not flushed until the slot is released.
    pub fn reserve(&self, stage: &str) -> Result<PendingOutcome, GatewayError> {
        if self.is_finalized() {
            return Err(GatewayError::AlreadyFinalized(self.request_id()));
        }
        Ok(PendingOutcome {
            shared: Arc::clone(&self.shared),
            stage: stage.to_string(),
            completed: false,
        })
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.finalized {
            state.finalized = true;
            let (status, detail) = if std::thread::panicking() {
                (FinalStatus::Failed, "panic")
            } else {
                (FinalStatus::Cancelled, "caller_gone")
            };
            state.record.final_status = status;
            state.record.status_detail = Some(detail.to_string());
            state.record.duration_ms = state.started.elapsed().as_millis() as u64;
            warn!(
                request_id = %state.record.request_id,
                final_status = status.as_str(),
                "audit trail dropped before finalize"
            );
        }
    }
}

/// A reserved stage outcome, completed out of band.
pub struct PendingOutcome {
    shared: Arc<TrailShared>,
    stage: String,
    completed: bool,
}

impl PendingOutcome {
    /// Record the late outcome along with its cost and routing decision.
    pub fn complete(
        mut self,
        outcome: &str,
        metadata: Value,
        cost: f64,
        routing: Option<RoutingDecision>,
    ) {
        let mut state = self.shared.lock();
        state.record.stage_outcomes.push(StageOutcome {
            stage: self.stage.clone(),
            outcome: outcome.to_string(),
            metadata,
            at: Utc::now(),
        });
        state.record.cost += cost;
        if routing.is_some() {
            state.record.routing = routing;
        }
        self.completed = true;
    }
}

impl Drop for PendingOutcome {
    fn drop(&mut self) {
        if !self.completed {
            let mut state = self.shared.lock();
            state.record.stage_outcomes.push(StageOutcome {
                stage: self.stage.clone(),
                outcome: "abandoned".into(),
                metadata: Value::Null,
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn recorder(sink: Arc<dyn AuditSink>) -> AuditRecorder {
        AuditRecorder::spawn(
            sink,
            &AuditConfig {
                retry_base_delay_ms: 1,
                ..AuditConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn finalize_flushes_exactly_once() {
        let sink = MemoryAuditSink::new();
        let rec = recorder(Arc::new(sink.clone()));

        let trail = rec.begin("req_1");
        trail.record("auth", "ok", json!({})).unwrap();
        trail.finalize(FinalStatus::Completed, None).unwrap();
        assert!(matches!(
            trail.record("late", "x", Value::Null),
            Err(GatewayError::AlreadyFinalized(_))
        ));
        assert!(trail.finalize(FinalStatus::Failed, None).is_err());
        drop(trail);

        assert!(rec.wait_idle(Duration::from_secs(1)).await);
        let records = sink.records_for("req_1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].final_status, FinalStatus::Completed);
        assert_eq!(records[0].stage_outcomes.len(), 1);
    }

    #[tokio::test]
    async fn dropped_trail_is_cancelled() {
        let sink = MemoryAuditSink::new();
        let rec = recorder(Arc::new(sink.clone()));
        {
            let trail = rec.begin("req_gone");
            trail.record("auth", "ok", Value::Null).unwrap();
        }
        assert!(rec.wait_idle(Duration::from_secs(1)).await);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].final_status, FinalStatus::Cancelled);
    }

    #[tokio::test]
    async fn pending_outcome_delays_flush() {
        let sink = MemoryAuditSink::new();
        let rec = recorder(Arc::new(sink.clone()));

        let trail = rec.begin("req_slow");
        let pending = trail.reserve("route").unwrap();
        trail
            .finalize(FinalStatus::Cancelled, Some("deadline".into()))
            .unwrap();
        drop(trail);

        assert!(rec.wait_idle(Duration::from_millis(50)).await);
        assert!(sink.records().is_empty());

        pending.complete("ok", json!({"provider": "p1"}), 0.25, None);
        assert!(rec.wait_idle(Duration::from_secs(1)).await);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].final_status, FinalStatus::Cancelled);
        assert_eq!(records[0].stage("route").unwrap().outcome, "ok");
        assert!((records[0].cost - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn pii_entities_are_merged() {
        let sink = MemoryAuditSink::new();
        let rec = recorder(Arc::new(sink.clone()));
        let trail = rec.begin("req_pii");
        trail.add_pii_entities(&["SSN".into()]).unwrap();
        trail
            .add_pii_entities(&["EMAIL_ADDRESS".into(), "SSN".into()])
            .unwrap();
        trail.finalize(FinalStatus::Completed, None).unwrap();
        drop(trail);
        assert!(rec.wait_idle(Duration::from_secs(1)).await);
        let r = &sink.records()[0];
        assert!(r.pii_detected);
        assert_eq!(r.pii_entities, vec!["EMAIL_ADDRESS", "SSN"]);
    }

    /// Fails the first `failures` writes.
    struct Unreliable {
        failures: u32,
        calls: AtomicU32,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for Unreliable {
        fn name(&self) -> &str {
            "unreliable"
        }

        async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AuditError::WriteFailed("sink offline".into()));
            }
            self.inner.write(record).await
        }
    }

    #[tokio::test]
    async fn transient_sink_failure_is_retried() {
        let inner = MemoryAuditSink::new();
        let sink = Arc::new(Unreliable {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: inner.clone(),
        });
        let rec = recorder(sink);
        let trail = rec.begin("req_retry");
        trail.finalize(FinalStatus::Completed, None).unwrap();
        drop(trail);

        assert!(rec.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(inner.records().len(), 1);
        let health = rec.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.sink_failures, 0);
    }

    #[tokio::test]
    async fn sustained_failure_degrades_health_then_recovers() {
        let inner = MemoryAuditSink::new();
        let sink = Arc::new(Unreliable {
            failures: 3,
            calls: AtomicU32::new(0),
            inner: inner.clone(),
        });
        let rec = AuditRecorder::spawn(
            sink,
            &AuditConfig {
                max_retries: 2,
                retry_base_delay_ms: 1,
                ..AuditConfig::default()
            },
        );
        let trail = rec.begin("req_outage");
        trail.finalize(FinalStatus::Completed, None).unwrap();
        drop(trail);

        assert!(rec.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(inner.records().len(), 1, "record kept and delivered later");
        let health = rec.health();
        assert!(health.sink_failures >= 1);
        assert_eq!(health.dropped, 0);
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn jsonl_chain_verifies_and_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlFileAuditSink::open(&path).unwrap());
        let rec = recorder(sink);

        for i in 0..3 {
            let trail = rec.begin(format!("req_{i}"));
            trail.record("auth", "ok", json!({"n": i})).unwrap();
            trail.finalize(FinalStatus::Completed, None).unwrap();
        }
        assert!(rec.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(verify_chain(&path).unwrap(), 3);

        // Reopening resumes the chain.
        let reopened = Arc::new(JsonlFileAuditSink::open(&path).unwrap());
        let rec2 = recorder(reopened);
        let trail = rec2.begin("req_3");
        trail.finalize(FinalStatus::Rejected, Some("quota".into())).unwrap();
        drop(trail);
        assert!(rec2.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(verify_chain(&path).unwrap(), 4);

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replacen("req_1", "req_X", 1)).unwrap();
        assert!(matches!(
            verify_chain(&path),
            Err(AuditError::ChainBroken { line: 2, .. })
        ));
    }

    fn completed_record(request_id: &str) -> AuditRecord {
        AuditRecord {
            request_id: request_id.to_string(),
            correlation_id: None,
            principal_id: Some("u1".into()),
            tenant_id: Some("tenant-a".into()),
            target_model: Some("gpt-4".into()),
            timestamp: Utc::now(),
            stage_outcomes: Vec::new(),
            final_status: FinalStatus::Completed,
            status_detail: None,
            cost: 0.001,
            duration_ms: 12,
            pii_detected: false,
            pii_entities: Vec::new(),
            flagged_for_review: false,
            routing: None,
        }
    }

    /// Writes some or all of the line to the real file, then errors.
    struct FailingFile {
        inner: tokio::fs::File,
        torn: bool,
        truncate_fails: bool,
    }

    #[async_trait]
    impl ChainFile for FailingFile {
        async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
            let written = if self.torn { &line[..line.len() / 2] } else { line };
            self.inner.append(written).await?;
            Err(std::io::Error::other("disk full"))
        }

        async fn size(&mut self) -> std::io::Result<u64> {
            self.inner.size().await
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            if self.truncate_fails {
                return Err(std::io::Error::other("read-only"));
            }
            self.inner.truncate(len).await
        }
    }

    async fn inject(sink: &JsonlFileAuditSink, torn: bool, truncate_fails: bool) {
        let inner = tokio::fs::OpenOptions::new()
            .append(true)
            .open(sink.path())
            .await
            .unwrap();
        sink.state.lock().await.file = Some(Box::new(FailingFile {
            inner,
            torn,
            truncate_fails,
        }));
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlFileAuditSink::open(&path).unwrap();
        sink.write(&completed_record("req_0")).await.unwrap();

        // Whole line written, then the flush reports an error.
        inject(&sink, false, false).await;
        assert!(sink.write(&completed_record("req_1")).await.is_err());
        assert_eq!(line_count(&path), 1);

        sink.write(&completed_record("req_1")).await.unwrap();
        assert_eq!(verify_chain(&path).unwrap(), 2);
    }

    #[tokio::test]
    async fn torn_line_is_truncated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlFileAuditSink::open(&path).unwrap();
        sink.write(&completed_record("req_0")).await.unwrap();

        inject(&sink, true, true).await;
        assert!(sink.write(&completed_record("req_1")).await.is_err());
        assert!(verify_chain(&path).is_err());

        sink.write(&completed_record("req_1")).await.unwrap();
        sink.write(&completed_record("req_2")).await.unwrap();
        assert_eq!(verify_chain(&path).unwrap(), 3);
        assert!(JsonlFileAuditSink::open(&path).is_ok());
    }
}
