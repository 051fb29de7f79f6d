use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::ErrorCategory;
use crate::classify::{categorize_error, error_type_name};

/// Entries returned in [`ErrorStatistics::recent_errors`].
const RECENT_ERRORS: usize = 10;
/// Floor applied to jittered delays, in seconds.
const MIN_JITTERED_DELAY: f64 = 0.1;
const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Error contexts kept for diagnostics; older entries are dropped.
    pub max_history: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            max_history: 1000,
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub error: String,
    pub error_type: String,
    pub category: ErrorCategory,
    pub operation: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    /// Backtrace at the point of recording; empty unless backtraces are
    /// enabled through `RUST_BACKTRACE`.
    pub trace: String,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_category: BTreeMap<String, u64>,
    /// Keyed `category:type`.
    pub by_type: BTreeMap<String, u64>,
    pub recent_errors: Vec<ErrorContext>,
}

#[derive(Debug, Default)]
struct History {
    entries: VecDeque<ErrorContext>,
    by_category: HashMap<ErrorCategory, u64>,
    by_type: HashMap<String, u64>,
}

type FatalHook = Arc<dyn Fn(&ErrorContext) + Send + Sync>;

/// Classifies failures, retries the transient ones with exponential backoff
/// and keeps a bounded history of what went wrong.
pub struct ErrorHandler {
    config: RetryConfig,
    history: Mutex<History>,
    fatal_hook: Option<FatalHook>,
}

impl ErrorHandler {
    pub fn new(config: RetryConfig) -> Self {
        let mut config = config;

        if !(config.exponential_base.is_finite() && config.exponential_base > 0.0) {
            config.exponential_base = 2.0;
        }
        if config.max_delay < config.base_delay {
            config.max_delay = config.base_delay;
        }
        if config.max_history == 0 {
            config.max_history = RetryConfig::default().max_history;
        }

        Self {
            config,
            history: Mutex::new(History::default()),
            fatal_hook: None,
        }
    }

    /// Called with the recorded context whenever a fatal error stops a retry
    /// loop. Replaces the default `error!` event.
    pub fn with_fatal_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorContext) + Send + Sync + 'static,
    {
        self.fatal_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn categorize_error<E: Error + 'static>(&self, error: &E) -> ErrorCategory {
        categorize_error(error)
    }

    pub fn should_retry<E: Error + 'static>(&self, error: &E, attempt: u32) -> bool {
        self.retry_allowed(categorize_error(error), attempt)
    }

    fn retry_allowed(&self, category: ErrorCategory, attempt: u32) -> bool {
        attempt < self.config.max_retries && category.is_retryable()
    }

    /// `min(base_delay * exponential_base^attempt, max_delay)`, then with
    /// jitter enabled moved by up to ±25% and floored at 100ms.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay.as_secs_f64() * self.config.exponential_base.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        let capped = if raw.is_nan() { 0.0 } else { raw.min(max) };

        let secs = if self.config.jitter {
            let spread = capped * JITTER_FRACTION;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(MIN_JITTERED_DELAY)
        } else {
            capped
        };

        Duration::try_from_secs_f64(secs).unwrap_or(self.config.max_delay)
    }

    /// Runs `operation` up to `max_retries + 1` times. The closure receives the
    /// 0-based attempt number. Non-retryable errors are returned at once; after
    /// the final attempt the last error is returned unchanged.
    pub async fn with_retry<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let mut attempt = 0;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let category = categorize_error(&err);
            let context = self.record(&err, category, operation_name, attempt, HashMap::new());

            if !self.retry_allowed(category, attempt) {
                if category == ErrorCategory::Fatal {
                    self.report_fatal(&context);
                } else if category.is_retryable() {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "Operation failed after all retry attempts"
                    );
                } else {
                    warn!(
                        operation = operation_name,
                        category = %category,
                        error = %err,
                        "Non-retryable error"
                    );
                }
                return Err(err);
            }

            let delay = self.calculate_delay(attempt);
            warn!(
                operation = operation_name,
                attempt,
                category = %category,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retryable error, backing off"
            );
            drop(err);
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Runs `primary`; if it fails, records the failure and returns whatever
    /// `fallback` produces. `fallback` never runs when `primary` succeeds.
    pub async fn graceful_degradation<P, PFut, F, FFut, T, E1, E2>(
        &self,
        operation_name: &str,
        primary: P,
        fallback: F,
    ) -> Result<T, E2>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E1>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, E2>>,
        E1: Error + 'static,
        E2: Error + 'static,
    {
        let primary_err = match primary().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let category = categorize_error(&primary_err);
        self.record(&primary_err, category, operation_name, 0, stage("primary"));
        warn!(
            operation = operation_name,
            category = %category,
            error = %primary_err,
            "Primary operation failed, using fallback"
        );
        drop(primary_err);

        match fallback().await {
            Ok(value) => {
                info!(operation = operation_name, "Fallback succeeded");
                Ok(value)
            }
            Err(err) => {
                let category = categorize_error(&err);
                self.record(&err, category, operation_name, 0, stage("fallback"));
                error!(operation = operation_name, error = %err, "Fallback also failed");
                Err(err)
            }
        }
    }

    pub fn get_error_statistics(&self) -> ErrorStatistics {
        let history = self.history.lock();
        ErrorStatistics {
            total_errors: history.by_category.values().sum(),
            by_category: history
                .by_category
                .iter()
                .map(|(category, count)| (category.to_string(), *count))
                .collect(),
            by_type: history
                .by_type
                .iter()
                .map(|(key, count)| (key.clone(), *count))
                .collect(),
            recent_errors: history
                .entries
                .iter()
                .rev()
                .take(RECENT_ERRORS)
                .rev()
                .cloned()
                .collect(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().entries.len()
    }

    pub fn clear_history(&self) {
        *self.history.lock() = History::default();
    }

    fn record<E>(
        &self,
        err: &E,
        category: ErrorCategory,
        operation: &str,
        attempt: u32,
        mut metadata: HashMap<String, Value>,
    ) -> ErrorContext
    where
        E: Error + 'static,
    {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(Value::String(cause.to_string()));
            source = cause.source();
        }
        if !causes.is_empty() {
            metadata.insert("caused_by".to_string(), Value::Array(causes));
        }

        let backtrace = Backtrace::capture();
        let context = ErrorContext {
            error: err.to_string(),
            error_type: error_type_name(err),
            category,
            operation: operation.to_string(),
            attempt,
            timestamp: Utc::now(),
            trace: match backtrace.status() {
                BacktraceStatus::Captured => backtrace.to_string(),
                _ => String::new(),
            },
            metadata,
        };

        let mut history = self.history.lock();
        *history.by_category.entry(category).or_default() += 1;
        *history
            .by_type
            .entry(format!("{}:{}", category, context.error_type))
            .or_default() += 1;
        history.entries.push_back(context.clone());
        while history.entries.len() > self.config.max_history {
            history.entries.pop_front();
        }

        context
    }

    fn report_fatal(&self, context: &ErrorContext) {
        match &self.fatal_hook {
            Some(hook) => hook(context),
            None => error!(
                operation = %context.operation,
                attempt = context.attempt,
                error = %context.error,
                "Fatal error, not retrying"
            ),
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn stage(name: &str) -> HashMap<String, Value> {
    HashMap::from([("stage".to_string(), Value::String(name.to_string()))])
}
