//! Consumption strategies: which backend a failover transport uses next.
//!
//! Every strategy only considers names the circuit breaker reports as
//! available, and returns `None` when no name is eligible. Statistics are
//! kept in lock-free counters so recording a result never blocks selection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::config::StrategyKind;

use super::circuit_breaker::CircuitBreakerRegistry;

/// Weight given to a backend with no recorded history
const NEUTRAL_WEIGHT: f64 = 1.0;

/// Lowest weight a backend can decay to, so it is still probed occasionally
const MIN_WEIGHT: f64 = 0.01;

/// Average latency (ms) at which the latency factor halves
const LATENCY_HALF_WEIGHT_MS: f64 = 100.0;

pub trait ConsumptionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one of `available`, skipping names whose circuit is open.
    fn select_backend<'a>(
        &self,
        available: &'a [String],
        breaker: &CircuitBreakerRegistry,
    ) -> Option<&'a str>;

    /// Feed back the outcome of an operation on `backend`.
    fn record_result(&self, _backend: &str, _success: bool, _latency: Duration) {}
}

/// Build the strategy configured for a failover transport.
pub fn strategy_for(kind: StrategyKind) -> Arc<dyn ConsumptionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
        StrategyKind::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new()),
        StrategyKind::LatencyAware => Arc::new(LatencyAware::new()),
    }
}

fn eligible<'a>(available: &'a [String], breaker: &CircuitBreakerRegistry) -> Vec<&'a str> {
    available
        .iter()
        .map(String::as_str)
        .filter(|name| breaker.is_available(name))
        .collect()
}

/// Rotates through the eligible names.
///
/// The cursor wraps modulo the eligible set at call time, so backends
/// dropping out of or rejoining the set need no special handling.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumptionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select_backend<'a>(
        &self,
        available: &'a [String],
        breaker: &CircuitBreakerRegistry,
    ) -> Option<&'a str> {
        let names = eligible(available, breaker);
        if names.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % names.len();
        Some(names[index])
    }
}

/// Outcome history of one backend since process start.
#[derive(Debug, Default)]
struct BackendStats {
    successes: AtomicU64,
    failures: AtomicU64,
    /// Sum of recorded latencies in microseconds
    latency_us: AtomicU64,
    /// Number of latency samples in `latency_us`
    samples: AtomicU64,
}

impl BackendStats {
    fn record(&self, success: bool, latency: Duration, record_latency: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if record_latency {
            self.latency_us
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
            self.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mean latency in microseconds, `None` without samples.
    fn mean_latency_us(&self) -> Option<u64> {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        Some(self.latency_us.load(Ordering::Relaxed) / samples)
    }

    fn weight(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed) as f64;
        let failures = self.failures.load(Ordering::Relaxed) as f64;
        let total = successes + failures;
        if total == 0.0 {
            return NEUTRAL_WEIGHT;
        }

        let success_rate = successes / total;
        let latency_factor = match self.mean_latency_us() {
            Some(us) => LATENCY_HALF_WEIGHT_MS / (LATENCY_HALF_WEIGHT_MS + us as f64 / 1000.0),
            None => 1.0,
        };
        (success_rate * latency_factor).max(MIN_WEIGHT)
    }
}

/// Random selection proportional to a weight derived from each backend's
/// success rate and mean latency.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    stats: DashMap<String, BackendStats>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current weight of `backend`.
    pub fn weight(&self, backend: &str) -> f64 {
        self.stats
            .get(backend)
            .map(|stats| stats.weight())
            .unwrap_or(NEUTRAL_WEIGHT)
    }
}

impl ConsumptionStrategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select_backend<'a>(
        &self,
        available: &'a [String],
        breaker: &CircuitBreakerRegistry,
    ) -> Option<&'a str> {
        let names = eligible(available, breaker);
        let weighted: Vec<(&str, f64)> = names
            .into_iter()
            .map(|name| (name, self.weight(name)))
            .collect();

        let total: f64 = weighted.iter().map(|(_, weight)| weight).sum();
        let (last, _) = *weighted.last()?;

        let mut target = rand::rng().random_range(0.0..total);
        for (name, weight) in &weighted {
            if target < *weight {
                return Some(*name);
            }
            target -= weight;
        }
        // Float rounding can leave a sliver past the last bucket
        Some(last)
    }

    fn record_result(&self, backend: &str, success: bool, latency: Duration) {
        self.stats
            .entry(backend.to_string())
            .or_default()
            .record(success, latency, true);
    }
}

/// Picks the eligible backend with the lowest mean latency.
///
/// A backend without samples counts as fastest so new or recovered backends
/// get exercised. Ties go to the first name in declared order.
#[derive(Debug, Default)]
pub struct LatencyAware {
    stats: DashMap<String, BackendStats>,
}

impl LatencyAware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mean_latency(&self, backend: &str) -> Option<Duration> {
        self.stats
            .get(backend)
            .and_then(|stats| stats.mean_latency_us())
            .map(Duration::from_micros)
    }
}

impl ConsumptionStrategy for LatencyAware {
    fn name(&self) -> &'static str {
        "latency_aware"
    }

    fn select_backend<'a>(
        &self,
        available: &'a [String],
        breaker: &CircuitBreakerRegistry,
    ) -> Option<&'a str> {
        let mut best: Option<(&'a str, u64)> = None;
        for name in eligible(available, breaker) {
            let latency = self
                .stats
                .get(name)
                .and_then(|stats| stats.mean_latency_us())
                .unwrap_or(0);
            match best {
                Some((_, best_latency)) if best_latency <= latency => {}
                _ => best = Some((name, latency)),
            }
        }
        best.map(|(name, _)| name)
    }

    fn record_result(&self, backend: &str, success: bool, latency: Duration) {
        // Fast failures would otherwise make a broken backend look fastest
        self.stats
            .entry(backend.to_string())
            .or_default()
            .record(success, latency, success);
    }
}
