//! Quota limiting using per-principal token buckets.
//!
//! - One bucket per (principal, dimension), grouped under the principal key
//!   so a multi-dimension admission is checked and debited under one lock.
//! - Refill is lazy: `available = min(capacity, available + elapsed * rate)`
//!   computed on every access. No timer ever touches a bucket.
//! - Idle principals are swept opportunistically every `sweep_every`
//!   admissions, or explicitly through [`QuotaLimiter::purge_idle`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::types::{Principal, QuotaDimension, Tier};

/// Capacity and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimit {
    /// Maximum tokens the bucket can hold (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl BucketLimit {
    /// A bucket that refills its full capacity over `window`.
    pub fn per_window(capacity: f64, window: Duration) -> Self {
        Self {
            capacity,
            refill_per_second: capacity / window.as_secs_f64(),
        }
    }

    fn full_refill(&self) -> Duration {
        if self.refill_per_second > 0.0 {
            Duration::from_secs_f64(self.capacity / self.refill_per_second)
        } else {
            Duration::MAX
        }
    }
}

/// Limits for every dimension of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests: BucketLimit,
    pub tokens: BucketLimit,
    /// Accumulated cost, in USD.
    pub cost: BucketLimit,
}

impl TierLimits {
    pub fn get(&self, dimension: QuotaDimension) -> BucketLimit {
        match dimension {
            QuotaDimension::Requests => self.requests,
            QuotaDimension::Tokens => self.tokens,
            QuotaDimension::Cost => self.cost,
        }
    }

    fn standard(requests: f64, tokens: f64, cost_usd: f64) -> Self {
        Self {
            requests: BucketLimit::per_window(requests, Duration::from_secs(60)),
            tokens: BucketLimit::per_window(tokens, Duration::from_secs(3_600)),
            cost: BucketLimit::per_window(cost_usd, Duration::from_secs(86_400)),
        }
    }
}

/// Configuration for the quota limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub free: TierLimits,
    pub premium: TierLimits,
    pub enterprise: TierLimits,
    /// Buckets untouched for this long are dropped.
    pub idle_ttl_secs: u64,
    /// Sweep idle buckets every N admissions (0 disables the sweep).
    pub sweep_every: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: TierLimits::standard(10.0, 20_000.0, 0.50),
            premium: TierLimits::standard(100.0, 200_000.0, 10.0),
            enterprise: TierLimits::standard(1_000.0, 2_000_000.0, 100.0),
            idle_ttl_secs: 3_600,
            sweep_every: 1_024,
        }
    }
}

impl QuotaConfig {
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Token bucket state for one (principal, dimension).
#[derive(Debug, Clone)]
pub struct QuotaBucket {
    pub principal_id: String,
    pub dimension: QuotaDimension,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub tokens_available: f64,
    pub last_refill: Instant,
}

impl QuotaBucket {
    fn new(principal_id: &str, dimension: QuotaDimension, limit: BucketLimit, now: Instant) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            dimension,
            capacity: limit.capacity,
            refill_per_second: limit.refill_per_second,
            tokens_available: limit.capacity,
            last_refill: now,
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens_available =
            (self.tokens_available + elapsed * self.refill_per_second).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Time until `amount` tokens are available.
    fn wait_for(&self, amount: f64) -> Duration {
        if amount > self.capacity {
            // Never satisfiable; report a full refill window.
            return BucketLimit {
                capacity: self.capacity,
                refill_per_second: self.refill_per_second,
            }
            .full_refill();
        }
        let deficit = amount - self.tokens_available;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }
        let millis = (deficit / self.refill_per_second * 1_000.0).ceil().max(1.0);
        Duration::from_millis(millis as u64)
    }

    fn apply_limit(&mut self, limit: BucketLimit) {
        self.capacity = limit.capacity;
        self.refill_per_second = limit.refill_per_second;
        self.tokens_available = self.tokens_available.min(self.capacity);
    }
}

/// Result of a single-dimension admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub admitted: bool,
    /// Estimated wait before enough tokens accumulate. `None` when admitted.
    pub retry_after: Option<Duration>,
}

/// Read-only view of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub dimension: QuotaDimension,
    pub capacity: f64,
    pub tokens_available: f64,
}

struct PrincipalBuckets {
    tier: Tier,
    buckets: BTreeMap<QuotaDimension, QuotaBucket>,
    last_seen: Instant,
}

impl PrincipalBuckets {
    fn new(principal: &Principal, limits: &TierLimits, now: Instant) -> Self {
        let buckets = QuotaDimension::ALL
            .into_iter()
            .map(|d| (d, QuotaBucket::new(&principal.id, d, limits.get(d), now)))
            .collect();
        Self {
            tier: principal.tier,
            buckets,
            last_seen: now,
        }
    }
}

/// Token-bucket quota limiter keyed by principal.
pub struct QuotaLimiter {
    config: QuotaConfig,
    principals: DashMap<String, PrincipalBuckets>,
    admissions: AtomicU64,
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            principals: DashMap::new(),
            admissions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Check and debit a single dimension.
    pub fn admit(&self, principal: &Principal, dimension: QuotaDimension, amount: f64) -> Admission {
        match self.admit_all(principal, &[(dimension, amount)]) {
            Ok(()) => Admission {
                admitted: true,
                retry_after: None,
            },
            Err(err) => Admission {
                admitted: false,
                retry_after: err.retry_after(),
            },
        }
    }

    /// All-or-nothing admission across several dimensions.
    ///
    /// Either every dimension is debited, or none is and the error names
    /// the first dimension (in the given order) that could not admit.
    pub fn admit_all(
        &self,
        principal: &Principal,
        demands: &[(QuotaDimension, f64)],
    ) -> Result<(), GatewayError> {
        self.admit_all_at(principal, demands, Instant::now())
    }

    pub fn admit_all_at(
        &self,
        principal: &Principal,
        demands: &[(QuotaDimension, f64)],
        now: Instant,
    ) -> Result<(), GatewayError> {
        let limits = *self.config.limits(principal.tier);
        let result = {
            let mut entry = self
                .principals
                .entry(principal.id.clone())
                .or_insert_with(|| PrincipalBuckets::new(principal, &limits, now));
            let state = entry.value_mut();

            if state.tier != principal.tier {
                debug!(principal_id = %principal.id, from = %state.tier, to = %principal.tier, "tier changed, resizing buckets");
                for (dim, bucket) in state.buckets.iter_mut() {
                    bucket.apply_limit(limits.get(*dim));
                }
                state.tier = principal.tier;
            }
            state.last_seen = now;

            Self::check_and_debit(state, demands, now)
        };

        if let Err(GatewayError::QuotaExceeded {
            dimension,
            retry_after,
        }) = &result
        {
            warn!(
                principal_id = %principal.id,
                dimension = %dimension,
                retry_after_ms = retry_after.as_millis() as u64,
                "quota exceeded"
            );
            metrics::counter!(crate::telemetry::QUOTA_REJECTIONS_TOTAL, "dimension" => dimension.as_str())
                .increment(1);
        }

        // The entry guard is released above; sweeping takes shard locks.
        let count = self.admissions.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.sweep_every > 0 && count % self.config.sweep_every == 0 {
            self.purge_idle_at(now);
        }

        result
    }

    fn check_and_debit(
        state: &mut PrincipalBuckets,
        demands: &[(QuotaDimension, f64)],
        now: Instant,
    ) -> Result<(), GatewayError> {
        for bucket in state.buckets.values_mut() {
            bucket.refill(now);
        }

        // Per-dimension totals, in case a dimension is listed twice.
        let mut totals: BTreeMap<QuotaDimension, f64> = BTreeMap::new();
        for (dim, amount) in demands {
            *totals.entry(*dim).or_default() += amount.max(0.0);
        }

        for (dim, _) in demands {
            let needed = totals[dim];
            let bucket = &state.buckets[dim];
            if needed > bucket.tokens_available {
                return Err(GatewayError::QuotaExceeded {
                    dimension: *dim,
                    retry_after: bucket.wait_for(needed),
                });
            }
        }

        for (dim, needed) in totals {
            if let Some(bucket) = state.buckets.get_mut(&dim) {
                bucket.tokens_available = (bucket.tokens_available - needed).max(0.0);
            }
        }
        Ok(())
    }

    /// Snapshot of a principal's buckets, refilled to `now`.
    pub fn usage(&self, principal_id: &str) -> Vec<BucketSnapshot> {
        let now = Instant::now();
        self.principals
            .get_mut(principal_id)
            .map(|mut entry| {
                entry
                    .buckets
                    .values_mut()
                    .map(|b| {
                        b.refill(now);
                        BucketSnapshot {
                            dimension: b.dimension,
                            capacity: b.capacity,
                            tokens_available: b.tokens_available,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop principals idle for longer than the configured TTL.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl();
        let before = self.principals.len();
        self.principals
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < ttl);
        let removed = before.saturating_sub(self.principals.len());
        if removed > 0 {
            debug!(removed, active = self.principals.len(), "purged idle quota buckets");
        }
        removed
    }

    /// Number of principals with live buckets.
    pub fn active_principals(&self) -> usize {
        self.principals.len()
    }
}
