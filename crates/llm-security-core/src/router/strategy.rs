//! Endpoint selection strategies.
//!
//! A strategy only picks the *first* endpoint to try. The rest of the
//! candidate chain always follows the configured fallback order.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::Endpoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    /// Smooth weighted round-robin.
    Weighted,
    /// Lowest moving average of successful call latency.
    LeastLatency,
    /// Fewest calls currently in flight.
    LeastConnections,
    /// Smallest endpoint whose capabilities cover the request.
    Capability,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::Weighted => "weighted",
            RoutingStrategy::LeastLatency => "least_latency",
            RoutingStrategy::LeastConnections => "least_connections",
            RoutingStrategy::Capability => "capability",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request attributes the capability strategy matches against.
#[derive(Debug, Clone, Copy)]
pub struct RequestTraits<'a> {
    pub task_type: Option<&'a str>,
    pub estimated_tokens: u64,
}

/// Mutable selection state shared by concurrent requests.
pub struct Selector {
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
    /// Smooth-WRR running weights, indexed by endpoint id.
    current_weights: Mutex<Vec<i64>>,
}

impl Selector {
    pub fn new(strategy: RoutingStrategy, endpoint_count: usize) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            current_weights: Mutex::new(vec![0; endpoint_count]),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Index into `candidates` of the endpoint to try first.
    pub fn pick(&self, candidates: &[Arc<Endpoint>], traits: RequestTraits<'_>) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let picked = match self.strategy {
            RoutingStrategy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            RoutingStrategy::Weighted => self.pick_weighted(candidates),
            RoutingStrategy::LeastLatency => min_index(candidates, |e| e.latency_ewma_ms()),
            RoutingStrategy::LeastConnections => {
                min_index(candidates, |e| e.in_flight() as f64)
            }
            RoutingStrategy::Capability => pick_capability(candidates, traits),
        };
        Some(picked)
    }

    fn pick_weighted(&self, candidates: &[Arc<Endpoint>]) -> usize {
        let mut weights = match self.current_weights.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let total: i64 = candidates.iter().map(|e| i64::from(e.weight())).sum();
        let mut best = 0;
        let mut best_weight = i64::MIN;
        for (i, endpoint) in candidates.iter().enumerate() {
            let Some(slot) = weights.get_mut(endpoint.id()) else {
                continue;
            };
            *slot += i64::from(endpoint.weight());
            if *slot > best_weight {
                best_weight = *slot;
                best = i;
            }
        }
        if let Some(slot) = weights.get_mut(candidates[best].id()) {
            *slot -= total;
        }
        best
    }
}

/// First index with the smallest key.
fn min_index(candidates: &[Arc<Endpoint>], key: impl Fn(&Endpoint) -> f64) -> usize {
    let mut best = 0;
    let mut best_key = f64::INFINITY;
    for (i, endpoint) in candidates.iter().enumerate() {
        let k = key(&**endpoint);
        if k < best_key {
            best_key = k;
            best = i;
        }
    }
    best
}

fn pick_capability(candidates: &[Arc<Endpoint>], traits: RequestTraits<'_>) -> usize {
    let fits_tokens = |e: &Endpoint| {
        e.max_context_tokens()
            .map_or(true, |max| max >= traits.estimated_tokens)
    };
    let covers_task = |e: &Endpoint| match traits.task_type {
        Some(task) => e.supports_task(task),
        None => true,
    };

    let smallest = |filter: &dyn Fn(&Endpoint) -> bool| {
        candidates
            .iter()
            .map(|e| &**e)
            .enumerate()
            .filter(|(_, e)| filter(*e))
            .min_by_key(|(i, e)| (e.max_context_tokens().unwrap_or(u64::MAX), *i))
            .map(|(i, _)| i)
    };

    smallest(&|e| fits_tokens(e) && covers_task(e))
        .or_else(|| smallest(&|e| fits_tokens(e)))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::breaker::BreakerConfig;
    use crate::router::provider::EchoProvider;
    use crate::router::ProviderEndpointConfig;

    fn endpoint(id: usize, name: &str, weight: u32, max_ctx: Option<u64>, tasks: &[&str]) -> Arc<Endpoint> {
        let config = ProviderEndpointConfig {
            weight,
            max_context_tokens: max_ctx,
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            ..ProviderEndpointConfig::named(name)
        };
        Arc::new(Endpoint::new(
            id,
            config,
            Arc::new(EchoProvider::new(name)),
            BreakerConfig::default(),
        ))
    }

    fn traits() -> RequestTraits<'static> {
        RequestTraits {
            task_type: None,
            estimated_tokens: 100,
        }
    }

    #[test]
    fn round_robin_cycles() {
        let eps = vec![endpoint(0, "a", 1, None, &[]), endpoint(1, "b", 1, None, &[])];
        let s = Selector::new(RoutingStrategy::RoundRobin, 2);
        let picks: Vec<_> = (0..4).map(|_| s.pick(&eps, traits()).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn smooth_weighted_distribution() {
        let eps = vec![
            endpoint(0, "a", 5, None, &[]),
            endpoint(1, "b", 1, None, &[]),
            endpoint(2, "c", 1, None, &[]),
        ];
        let s = Selector::new(RoutingStrategy::Weighted, 3);
        let picks: Vec<_> = (0..7).map(|_| s.pick(&eps, traits()).unwrap()).collect();
        // nginx smooth WRR sequence for weights 5/1/1.
        assert_eq!(picks, vec![0, 0, 1, 0, 2, 0, 0]);
    }

    #[test]
    fn least_connections_prefers_idle() {
        let eps = vec![endpoint(0, "a", 1, None, &[]), endpoint(1, "b", 1, None, &[])];
        let _busy = eps[0].begin_call();
        let s = Selector::new(RoutingStrategy::LeastConnections, 2);
        assert_eq!(s.pick(&eps, traits()), Some(1));
    }

    #[test]
    fn least_latency_prefers_fast() {
        let eps = vec![endpoint(0, "a", 1, None, &[]), endpoint(1, "b", 1, None, &[])];
        eps[0].record_latency(400.0);
        eps[1].record_latency(50.0);
        let s = Selector::new(RoutingStrategy::LeastLatency, 2);
        assert_eq!(s.pick(&eps, traits()), Some(1));
    }

    #[test]
    fn capability_picks_smallest_fit() {
        let eps = vec![
            endpoint(0, "big", 1, Some(128_000), &[]),
            endpoint(1, "small", 1, Some(4_000), &["summarize"]),
            endpoint(2, "coder", 1, Some(16_000), &["code"]),
        ];
        let s = Selector::new(RoutingStrategy::Capability, 3);
        assert_eq!(s.pick(&eps, traits()), Some(1));

        let code = RequestTraits {
            task_type: Some("code"),
            estimated_tokens: 2_000,
        };
        assert_eq!(s.pick(&eps, code), Some(2));

        let huge = RequestTraits {
            task_type: Some("summarize"),
            estimated_tokens: 50_000,
        };
        assert_eq!(s.pick(&eps, huge), Some(0));
    }

    #[test]
    fn empty_candidates() {
        let s = Selector::new(RoutingStrategy::RoundRobin, 0);
        assert_eq!(s.pick(&[], traits()), None);
    }
}
