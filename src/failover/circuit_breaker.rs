//! Per-backend circuit breakers for the failover layer

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::config::CircuitBreakerSettings;
use crate::error::QueueError;
use crate::infrastructure::current_time_ms;
use crate::metrics::FailoverMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow through normally
    Closed = 0,
    /// Circuit is open, the backend is skipped
    Open = 1,
    /// Cooldown elapsed; the next call decides between closed and open
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before an open circuit lets a probe through
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_secs(settings.cooldown_seconds),
        }
    }
}

/// State of a single backend name.
struct BreakerEntry {
    /// Current state (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    /// Consecutive failure count
    failure_count: AtomicU32,
    /// Timestamp of last state change (ms since epoch)
    last_state_change: AtomicI64,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            last_state_change: AtomicI64::new(current_time_ms()),
        }
    }

    fn load(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    fn store(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
        self.last_state_change
            .store(current_time_ms(), Ordering::Release);
    }
}

/// Breaker statistics snapshot for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Circuit breakers keyed by backend name.
///
/// Entries are created lazily on first use and live only in this process.
/// One instance is owned by a failover transport and shared by its sender
/// and receiver; different names never influence each other.
pub struct CircuitBreakerRegistry {
    /// Owning transport, used as the metrics label
    transport: String,
    entries: DashMap<String, BreakerEntry>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(transport: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            transport: transport.into(),
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether calls to `name` should be attempted.
    ///
    /// An open circuit becomes available again once the cooldown has elapsed.
    pub fn is_available(&self, name: &str) -> bool {
        self.state(name) != CircuitState::Open
    }

    /// Current state, moving open to half-open once the cooldown has passed.
    pub fn state(&self, name: &str) -> CircuitState {
        let Some(entry) = self.entries.get(name) else {
            return CircuitState::Closed;
        };

        let state = entry.load();
        if state != CircuitState::Open {
            return state;
        }

        let elapsed = current_time_ms() - entry.last_state_change.load(Ordering::Acquire);
        if elapsed < self.config.cooldown.as_millis() as i64 {
            return CircuitState::Open;
        }

        if entry
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            entry
                .last_state_change
                .store(current_time_ms(), Ordering::Release);
            FailoverMetrics::record_transition(&self.transport, name, CircuitState::HalfOpen.as_str());
            tracing::info!(transport = %self.transport, backend = %name, "Circuit breaker half-open, probing backend");
        }

        entry.load()
    }

    /// Record a successful operation: the failure count resets and the
    /// circuit closes.
    pub fn record_success(&self, name: &str) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        entry.failure_count.store(0, Ordering::Release);
        let previous = entry.load();
        if previous != CircuitState::Closed {
            entry.store(CircuitState::Closed);
            FailoverMetrics::record_transition(&self.transport, name, CircuitState::Closed.as_str());
            tracing::info!(
                transport = %self.transport,
                backend = %name,
                previous = %previous,
                "Circuit breaker closed after successful call"
            );
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self, name: &str, error: &QueueError) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(BreakerEntry::new);

        let failure_count = entry.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match entry.load() {
            CircuitState::Closed => {
                if failure_count >= self.config.failure_threshold {
                    entry.store(CircuitState::Open);
                    FailoverMetrics::record_transition(&self.transport, name, CircuitState::Open.as_str());
                    tracing::warn!(
                        transport = %self.transport,
                        backend = %name,
                        failures = failure_count,
                        error = %error,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed
                entry.store(CircuitState::Open);
                FailoverMetrics::record_transition(&self.transport, name, CircuitState::Open.as_str());
                tracing::warn!(
                    transport = %self.transport,
                    backend = %name,
                    error = %error,
                    "Circuit breaker reopened after failed probe"
                );
            }
            CircuitState::Open => {
                // Already open, restart the cooldown
                entry
                    .last_state_change
                    .store(current_time_ms(), Ordering::Release);
            }
        }
    }

    pub fn failure_count(&self, name: &str) -> u32 {
        self.entries
            .get(name)
            .map(|entry| entry.failure_count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Snapshot of every backend seen so far, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut stats: Vec<CircuitBreakerStats> = names
            .into_iter()
            .map(|name| CircuitBreakerStats {
                state: self.state(&name),
                failure_count: self.failure_count(&name),
                name,
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> QueueError {
        QueueError::Unavailable("down".to_string())
    }

    fn registry(threshold: u32, cooldown: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn test_unknown_backend_is_available() {
        let breaker = registry(3, Duration::from_secs(60));
        assert!(breaker.is_available("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
        assert_eq!(breaker.failure_count("primary"), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = registry(3, Duration::from_secs(60));

        breaker.record_failure("primary", &failure());
        breaker.record_failure("primary", &failure());
        assert!(breaker.is_available("primary"));

        breaker.record_failure("primary", &failure());
        assert!(!breaker.is_available("primary"));
        assert_eq!(breaker.state("primary"), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = registry(3, Duration::from_secs(60));

        breaker.record_failure("primary", &failure());
        breaker.record_failure("primary", &failure());
        breaker.record_success("primary");
        assert_eq!(breaker.failure_count("primary"), 0);

        breaker.record_failure("primary", &failure());
        assert!(breaker.is_available("primary"));
    }

    #[test]
    fn test_backends_are_isolated() {
        let breaker = registry(1, Duration::from_secs(60));

        breaker.record_failure("primary", &failure());
        assert!(!breaker.is_available("primary"));
        assert!(breaker.is_available("secondary"));
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breaker = registry(1, Duration::ZERO);

        breaker.record_failure("primary", &failure());
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);
        assert!(breaker.is_available("primary"));

        // Failed probe reopens; zero cooldown lets the next probe through again
        breaker.record_failure("primary", &failure());
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);

        breaker.record_success("primary");
        assert_eq!(breaker.state("primary"), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = registry(1, Duration::from_millis(20));

        breaker.record_failure("primary", &failure());
        assert!(!breaker.is_available("primary"));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state("primary"), CircuitState::HalfOpen);

        breaker.record_failure("primary", &failure());
        assert_eq!(breaker.state("primary"), CircuitState::Open);
    }

    #[test]
    fn test_snapshot() {
        let breaker = registry(1, Duration::from_secs(60));
        breaker.record_success("b");
        breaker.record_failure("a", &failure());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[0].failure_count, 1);
        assert_eq!(snapshot[1].state, CircuitState::Closed);
    }
}
