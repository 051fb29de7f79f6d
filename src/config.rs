use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{CircuitBreakerConfig, CoreError, CoreResult, DependencyFailurePolicy, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    /// Applied to tasks that don't set their own timeout.
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
    pub dependency_failure: DependencyFailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_timeout: Duration::from_secs(300),
            dependency_failure: DependencyFailurePolicy::RunAnyway,
        }
    }
}

/// Everything the execution core needs at construction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let scheduler = &self.scheduler;
        if scheduler.max_concurrency == 0 {
            return Err(CoreError::Config("scheduler.max_concurrency must be at least 1".into()));
        }
        if scheduler.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(CoreError::Config(format!(
                "scheduler.max_concurrency must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if scheduler.default_timeout.is_zero() {
            return Err(CoreError::Config("scheduler.default_timeout must be positive".into()));
        }

        let retry = &self.retry;
        if !(retry.exponential_base.is_finite() && retry.exponential_base > 0.0) {
            return Err(CoreError::Config("retry.exponential_base must be positive".into()));
        }
        if retry.max_delay < retry.base_delay {
            return Err(CoreError::Config("retry.max_delay must not be below retry.base_delay".into()));
        }
        if retry.max_history == 0 {
            return Err(CoreError::Config("retry.max_history must be at least 1".into()));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(CoreError::Config(
                "circuit_breaker thresholds must be at least 1".into(),
            ));
        }
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(CoreError::Config(
                "circuit_breaker.failure_rate_threshold must be in (0, 1]".into(),
            ));
        }
        if breaker.half_open_max_calls == 0 {
            return Err(CoreError::Config(
                "circuit_breaker.half_open_max_calls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_object_yields_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn durations_are_read_as_seconds() {
        let config = CoreConfig::from_json_str(
            r#"{
                "scheduler": { "max_concurrency": 8, "default_timeout": 2.5, "dependency_failure": "skip" },
                "retry": { "base_delay": 0.25, "jitter": false },
                "circuit_breaker": { "reset_timeout": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_concurrency, 8);
        assert_eq!(config.scheduler.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.scheduler.dependency_failure, DependencyFailurePolicy::Skip);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert!(!config.retry.jitter);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for raw in [
            r#"{"scheduler": {"max_concurrency": 0}}"#,
            r#"{"retry": {"max_history": 0}}"#,
            r#"{"retry": {"base_delay": 10, "max_delay": 1}}"#,
            r#"{"circuit_breaker": {"failure_rate_threshold": 1.5}}"#,
            r#"{"circuit_breaker": {"reset_timeout": -1}}"#,
        ] {
            let err = CoreConfig::from_json_str(raw).unwrap_err();
            assert!(matches!(err, CoreError::Config(_)), "{raw} should be rejected");
        }
    }

    #[test]
    fn concurrency_above_semaphore_capacity_is_rejected() {
        let mut config = CoreConfig::default();
        config.scheduler.max_concurrency = usize::MAX;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        config.scheduler.max_concurrency = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let config = CoreConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        assert_eq!(CoreConfig::from_json_str(&raw).unwrap(), config);
    }
}
