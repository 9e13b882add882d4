use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub transports: HashMap<String, TransportSettings>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub otel: OtelConfig,
}

/// One named transport. The `kind` key selects the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSettings {
    Postgres(PostgresTransportSettings),
    Redis(RedisTransportSettings),
    Memory(MemoryTransportSettings),
    Failover(FailoverTransportSettings),
}

impl TransportSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportSettings::Postgres(_) => "postgres",
            TransportSettings::Redis(_) => "redis",
            TransportSettings::Memory(_) => "memory",
            TransportSettings::Failover(_) => "failover",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresTransportSettings {
    pub url: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Seconds before an unacknowledged claim is treated as abandoned
    #[serde(default = "default_redeliver_timeout")]
    pub redeliver_timeout: u64,
    #[serde(default = "default_true")]
    pub auto_setup: bool,
    /// Use `FOR UPDATE SKIP LOCKED`; when false a blocking `FOR UPDATE` is used
    #[serde(default = "default_true")]
    pub skip_locked: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTransportSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_queue")]
    pub queue: String,
    /// Defaults to `<queue>__queue`
    pub delayed_queue: Option<String>,
    #[serde(default = "default_redeliver_timeout")]
    pub redeliver_timeout: u64,
    /// Minimum spacing between abandoned-claim scans
    #[serde(default = "default_claim_interval_ms")]
    pub claim_interval_ms: u64,
    /// 0 keeps every entry
    #[serde(default)]
    pub queue_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryTransportSettings {
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_redeliver_timeout")]
    pub redeliver_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverTransportSettings {
    /// Names of already-configured engine transports, in declared order
    pub transports: Vec<String>,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub send_order: SendOrder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LatencyAware,
}

/// How the failover sender orders its candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOrder {
    /// First available transport in declared order
    #[default]
    Declared,
    /// Same strategy the receiver uses
    Strategy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_true() -> bool {
    true
}

fn default_table_name() -> String {
    "messenger_messages".to_string()
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_redeliver_timeout() -> u64 {
    3600 // 1 hour
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_queue() -> String {
    "messages".to_string()
}

fn default_claim_interval_ms() -> u64 {
    60_000 // 1 minute
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "reliable-queue".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("circuit_breaker.failure_threshold", default_failure_threshold())?
            .set_default("circuit_breaker.cooldown_seconds", default_cooldown_seconds())?
            .set_default("retry.max_attempts", default_max_attempts())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // QUEUE__RETRY__MAX_ATTEMPTS, QUEUE__TRANSPORTS__MAIN__URL, etc.
            .add_source(
                Environment::with_prefix("QUEUE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Parse settings from a TOML document, without files or environment.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
