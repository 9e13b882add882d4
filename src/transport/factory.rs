//! Builds named transports from [`Settings`].
//!
//! Engine transports are created first; failover transports are then
//! composed from engines already in the registry. Pools are shared between
//! transports that point at the same URL.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Settings, TransportSettings};
use crate::error::{QueueError, Result};
use crate::failover::{strategy_for, CircuitBreakerConfig, FailoverTransport};
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::redis::RedisPool;

use super::backend::QueueEngine;
use super::engine_transport::{EngineTransport, Transport};
use super::memory_backend::{MemoryQueueEngine, MemoryStore};
use super::models::{MemoryQueueConfig, PostgresQueueConfig, RedisQueueConfig};
use super::postgres_backend::PostgresQueueEngine;
use super::redis_backend::RedisQueueEngine;

/// Every configured transport, by name.
#[derive(Default)]
pub struct TransportRegistry {
    engines: HashMap<String, Arc<dyn QueueEngine>>,
    failovers: HashMap<String, Arc<FailoverTransport>>,
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).cloned()
    }

    /// Underlying engine of a single-backend transport
    pub fn engine(&self, name: &str) -> Option<Arc<dyn QueueEngine>> {
        self.engines.get(name).cloned()
    }

    pub fn failover(&self, name: &str) -> Option<Arc<FailoverTransport>> {
        self.failovers.get(name).cloned()
    }

    /// Transport names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Transport>)> {
        self.transports
            .iter()
            .map(|(name, transport)| (name.as_str(), transport))
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

/// Pools shared by engines with the same connection URL.
#[derive(Default)]
struct PoolCache {
    postgres: HashMap<String, PostgresPool>,
    redis: HashMap<String, Arc<RedisPool>>,
    memory: Arc<MemoryStore>,
}

/// Create every transport named in `settings`.
///
/// PostgreSQL pools connect lazily but need a running tokio runtime.
pub fn create_transports(settings: &Settings) -> Result<TransportRegistry> {
    let mut registry = TransportRegistry::default();
    let mut pools = PoolCache::default();

    let mut names: Vec<&String> = settings.transports.keys().collect();
    names.sort_unstable();

    for name in &names {
        let engine = match &settings.transports[*name] {
            TransportSettings::Failover(_) => continue,
            engine_settings => create_engine(engine_settings, settings, &mut pools)?,
        };

        tracing::info!(
            transport = %name,
            backend = engine.backend_type(),
            queue = %engine.queue_name(),
            "Transport created"
        );
        registry.transports.insert(
            name.to_string(),
            Arc::new(EngineTransport::new(name.as_str(), engine.clone())),
        );
        registry.engines.insert(name.to_string(), engine);
    }

    for name in &names {
        let TransportSettings::Failover(failover) = &settings.transports[*name] else {
            continue;
        };

        if failover.transports.len() < 2 {
            return Err(QueueError::NotEnoughTransports {
                given: failover.transports.len(),
            });
        }

        let mut backends = Vec::with_capacity(failover.transports.len());
        for backend in &failover.transports {
            let engine = match registry.engines.get(backend) {
                Some(engine) => engine.clone(),
                None if settings.transports.contains_key(backend) => {
                    return Err(QueueError::InvalidConfig(format!(
                        "failover transport \"{name}\" cannot include failover transport \"{backend}\""
                    )));
                }
                None => {
                    return Err(QueueError::InvalidConfig(format!(
                        "failover transport \"{name}\" names unknown transport \"{backend}\""
                    )));
                }
            };
            backends.push((backend.clone(), engine));
        }

        let transport = Arc::new(FailoverTransport::new(
            name.as_str(),
            backends,
            CircuitBreakerConfig::from(&settings.circuit_breaker),
            strategy_for(failover.strategy),
            failover.send_order,
        )?);

        tracing::info!(
            transport = %name,
            backends = ?failover.transports,
            strategy = transport.strategy_name(),
            "Failover transport created"
        );
        registry.failovers.insert(name.to_string(), transport.clone());
        registry.transports.insert(name.to_string(), transport);
    }

    Ok(registry)
}

fn create_engine(
    transport: &TransportSettings,
    settings: &Settings,
    pools: &mut PoolCache,
) -> Result<Arc<dyn QueueEngine>> {
    let engine: Arc<dyn QueueEngine> = match transport {
        TransportSettings::Postgres(pg) => {
            let pool = match pools.postgres.get(&pg.url) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = PostgresPool::connect_lazy(pg)?;
                    pools.postgres.insert(pg.url.clone(), pool.clone());
                    pool
                }
            };
            let config = PostgresQueueConfig::from_settings(pg, &settings.retry);
            Arc::new(PostgresQueueEngine::new(config, &pool)?)
        }
        TransportSettings::Redis(redis) => {
            let pool = match pools.redis.get(&redis.url) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = Arc::new(RedisPool::new(&redis.url)?);
                    pools.redis.insert(redis.url.clone(), pool.clone());
                    pool
                }
            };
            let config = RedisQueueConfig::from_settings(redis, &settings.retry);
            Arc::new(RedisQueueEngine::new(config, pool)?)
        }
        TransportSettings::Memory(memory) => {
            let config = MemoryQueueConfig::from_settings(memory);
            Arc::new(MemoryQueueEngine::with_store(config, pools.memory.clone())?)
        }
        TransportSettings::Failover(_) => {
            return Err(QueueError::InvalidConfig(
                "failover transports are not engines".to_string(),
            ));
        }
    };
    Ok(engine)
}
