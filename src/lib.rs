pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod plan;
pub mod executor;
pub mod circuit_breaker;
pub mod registry;
pub mod classify;
pub mod config;
pub mod context;

pub use task::{FnOperation, Operation, ResultStatus, Task, TaskReport, TaskResult, TaskStatus};
pub use retry::{ErrorContext, ErrorHandler, ErrorStatistics, RetryConfig};
pub use plan::ExecutionPlan;
pub use executor::{DependencyFailurePolicy, ParallelScheduler};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitOpenError, CircuitSnapshot,
    CircuitState, CircuitStats,
};
pub use registry::CircuitBreakerRegistry;
pub use classify::{ErrorCategory, OperationError, categorize_error, categorize_type_name};
pub use config::{CoreConfig, SchedulerConfig};
pub use context::ExecutionContext;
pub use cycle_check::find_cycle;

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub type TaskInput = HashMap<String, serde_json::Value>;
pub type CoreResult<T> = Result<T, CoreError>;

/// Exit code recorded for a task that raised an error.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code recorded for a task that exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code recorded for a task skipped because a prerequisite failed.
pub const EXIT_SKIPPED: i32 = 125;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("Task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: OperationError,
    },
    #[error("Task '{task}' timed out after {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
