use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::circuit_breaker::CircuitSnapshot;
use crate::{CircuitBreaker, CircuitBreakerConfig};

/// One shared [`CircuitBreaker`] per resource name, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it with the registry's
    /// default configuration if needed.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    /// Returns the breaker for `name`, creating it with `config` if needed.
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all_statistics(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut stats: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.get_statistics()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;
    use std::time::Duration;

    #[test]
    fn same_name_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.breaker("llm");
        let b = registry.get_or_create(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        assert!(Arc::ptr_eq(&a, &b));
        // first creation wins
        assert_eq!(b.config().failure_threshold, 5);
    }

    #[test]
    fn callers_share_counters() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        registry.breaker("db").record_failure();
        registry.breaker("db").record_failure();
        assert_eq!(registry.get("db").unwrap().state(), CircuitState::Open);
        assert!(registry.get("cache").is_none());
    }

    #[test]
    fn statistics_and_reset_cover_every_breaker() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.breaker("b").record_failure();
        registry.breaker("a").record_success();

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        let stats = registry.all_statistics();
        assert_eq!(stats[1].state, CircuitState::Open);

        registry.reset_all();
        assert!(registry
            .all_statistics()
            .iter()
            .all(|s| s.state == CircuitState::Closed));

        assert!(registry.remove("a").is_some());
        assert_eq!(registry.names(), vec!["b".to_string()]);
    }
}
