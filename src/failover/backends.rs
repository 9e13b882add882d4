use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::transport::QueueEngine;

/// Named queue engines composed by a failover transport, in declared order.
pub struct FailoverBackends {
    names: Vec<String>,
    engines: HashMap<String, Arc<dyn QueueEngine>>,
}

impl FailoverBackends {
    /// At least two uniquely named engines are required.
    pub fn new(backends: Vec<(String, Arc<dyn QueueEngine>)>) -> Result<Self> {
        if backends.len() < 2 {
            return Err(QueueError::NotEnoughTransports {
                given: backends.len(),
            });
        }

        let mut names = Vec::with_capacity(backends.len());
        let mut engines = HashMap::with_capacity(backends.len());
        for (name, engine) in backends {
            if engines.insert(name.clone(), engine).is_some() {
                return Err(QueueError::InvalidConfig(format!(
                    "transport \"{name}\" is listed twice"
                )));
            }
            names.push(name);
        }

        Ok(Self { names, engines })
    }

    /// Backend names in declared order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn QueueEngine>> {
        self.engines.get(name)
    }

    /// Engine for `name`, or `UnknownTransport` if it is not part of this set.
    pub fn require(&self, name: &str) -> Result<&Arc<dyn QueueEngine>> {
        self.get(name)
            .ok_or_else(|| QueueError::UnknownTransport(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn QueueEngine>)> {
        self.names
            .iter()
            .filter_map(|name| self.engines.get(name).map(|engine| (name.as_str(), engine)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryQueueConfig, MemoryQueueEngine};

    fn engine() -> Arc<dyn QueueEngine> {
        Arc::new(MemoryQueueEngine::new(MemoryQueueConfig::default()).unwrap())
    }

    #[test]
    fn test_requires_two_backends() {
        let result = FailoverBackends::new(vec![("only".to_string(), engine())]);
        assert!(matches!(
            result,
            Err(QueueError::NotEnoughTransports { given: 1 })
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = FailoverBackends::new(vec![
            ("a".to_string(), engine()),
            ("a".to_string(), engine()),
        ]);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn test_keeps_declared_order() {
        let backends = FailoverBackends::new(vec![
            ("b".to_string(), engine()),
            ("a".to_string(), engine()),
        ])
        .unwrap();

        assert_eq!(backends.names(), ["b", "a"]);
        let order: Vec<&str> = backends.iter().map(|(name, _)| name).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert!(backends.require("c").is_err());
    }
}
