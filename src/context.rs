use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    CircuitBreaker, CircuitBreakerRegistry, CoreConfig, CoreResult, ErrorHandler,
    ParallelScheduler, Task, TaskResult,
};

/// Application-wide handle on the execution core. Build one at startup and
/// pass it to whatever submits work; it owns the breaker registry and the
/// shared error handler.
pub struct ExecutionContext {
    config: CoreConfig,
    scheduler: ParallelScheduler,
    breakers: Arc<CircuitBreakerRegistry>,
    errors: Arc<ErrorHandler>,
}

impl ExecutionContext {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        info!(
            max_concurrency = config.scheduler.max_concurrency,
            default_timeout = ?config.scheduler.default_timeout,
            max_retries = config.retry.max_retries,
            "Execution context ready"
        );
        Ok(Self {
            scheduler: ParallelScheduler::new(config.scheduler.clone()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            errors: Arc::new(ErrorHandler::new(config.retry.clone())),
            config,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ParallelScheduler {
        &self.scheduler
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers.breaker(resource)
    }

    /// Routes `task` through the breaker for `resource` and the shared retry
    /// handler.
    pub fn protect(&self, task: Task, resource: &str) -> Task {
        task.with_circuit_breaker(self.breaker(resource))
            .with_error_handler(self.errors.clone())
    }

    pub async fn execute_parallel(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
        fail_fast: bool,
    ) -> CoreResult<HashMap<String, TaskResult>> {
        self.scheduler.execute_parallel(ctx, tasks, None, fail_fast).await
    }

    pub async fn execute_with_dependencies(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
    ) -> CoreResult<HashMap<String, TaskResult>> {
        self.scheduler.execute_with_dependencies(ctx, tasks).await
    }
}
