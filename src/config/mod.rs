mod settings;

pub use settings::{
    CircuitBreakerSettings, FailoverTransportSettings, MemoryTransportSettings, OtelConfig,
    PostgresTransportSettings, RedisTransportSettings, RetrySettings, SendOrder, Settings,
    StrategyKind, TransportSettings,
};
