//! Failover composition of several queue engines.
//!
//! - `circuit_breaker`: per-backend closed/open/half-open tracking
//! - `strategy`: backend selection (round robin, weighted, latency-aware)
//! - `sender` / `receiver`: the two halves of a failover transport
//! - `transport`: `FailoverTransport`, owning the shared breaker and strategy

mod backends;
pub mod circuit_breaker;
mod receiver;
mod sender;
pub mod strategy;
mod transport;

pub use backends::FailoverBackends;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use receiver::FailoverReceiver;
pub use sender::FailoverSender;
pub use strategy::{strategy_for, ConsumptionStrategy, LatencyAware, RoundRobin, WeightedRoundRobin};
pub use transport::FailoverTransport;
