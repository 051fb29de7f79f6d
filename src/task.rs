use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{CircuitBreaker, ErrorHandler, EXIT_SKIPPED, OperationError, TaskInput};

/// The unit of work a [`Task`] runs.
///
/// `execute` receives the task's parameters and a cancellation token that is
/// cancelled when the task times out or the caller aborts the run. Returning
/// `Err` means the operation raised; returning a [`TaskReport`] with a failed
/// status is a semantic failure that the scheduler records as-is.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn pre_execution(
        &self,
        _ctx: CancellationToken,
        _params: &TaskInput,
    ) -> Result<(), OperationError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskInput,
    ) -> Result<TaskReport, OperationError>;

    async fn post_execution(
        &self,
        _ctx: CancellationToken,
        _report: &TaskReport,
    ) -> Result<(), OperationError> {
        Ok(())
    }
}

type OperationFn = dyn Fn(CancellationToken, TaskInput) -> BoxFuture<'static, Result<TaskReport, OperationError>>
    + Send
    + Sync;

/// Adapts an async closure into an [`Operation`].
pub struct FnOperation {
    f: Box<OperationFn>,
}

impl FnOperation {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken, TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskReport, OperationError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx, params| Box::pin(f(ctx, params))),
        }
    }
}

#[async_trait]
impl Operation for FnOperation {
    async fn execute(
        &self,
        ctx: CancellationToken,
        params: &TaskInput,
    ) -> Result<TaskReport, OperationError> {
        (self.f)(ctx, params.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// What an operation reports when it returns normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: ResultStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub exit_code: i32,
}

impl TaskReport {
    pub fn success(output: impl Into<Value>) -> Self {
        Self {
            status: ResultStatus::Success,
            output: Some(output.into()),
            error: None,
            exit_code: 0,
        }
    }

    /// A failure the operation observed without raising, e.g. a child process
    /// exiting non-zero.
    pub fn failure(error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            status: ResultStatus::Failed,
            output: None,
            error: Some(error.into()),
            exit_code,
        }
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Per-task record handed back to callers of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ResultStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    #[serde(with = "crate::config::duration_secs")]
    pub duration: Duration,
    pub exit_code: i32,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// A named unit of work plus its scheduling metadata and runtime state.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub operation: Arc<dyn Operation>,
    pub parameters: TaskInput,
    pub dependencies: Vec<String>,
    /// Orders tasks inside a ready batch. It never delays a ready task.
    pub priority: i32,
    /// Falls back to the scheduler's default when `None`.
    pub timeout: Option<Duration>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub error_handler: Option<Arc<ErrorHandler>>,

    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl Task {
    pub fn new(name: impl Into<String>, operation: impl Operation + 'static) -> Self {
        Self::from_arc(name, Arc::new(operation))
    }

    pub fn from_arc(name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            operation,
            parameters: TaskInput::new(),
            dependencies: Vec::new(),
            priority: 0,
            timeout: None,
            circuit_breaker: None,
            error_handler: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            exit_code: None,
            start_time: None,
            end_time: None,
            duration: None,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken, TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskReport, OperationError>> + Send + 'static,
    {
        Self::new(name, FnOperation::new(f))
    }

    pub fn with_parameters(mut self, parameters: TaskInput) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_dependencies<I, S>(self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        dependencies
            .into_iter()
            .fold(self, |task, dep| task.depends_on(dep))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, report: TaskReport, elapsed: Duration) {
        self.status = match report.status {
            ResultStatus::Success => TaskStatus::Completed,
            ResultStatus::Failed => TaskStatus::Failed,
            ResultStatus::Skipped => TaskStatus::Skipped,
        };
        self.result = report.output;
        self.error = report.error;
        self.exit_code = Some(report.exit_code);
        self.finish(elapsed);
    }

    pub(crate) fn fail(&mut self, error: String, exit_code: i32, elapsed: Duration) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.exit_code = Some(exit_code);
        self.finish(elapsed);
    }

    pub(crate) fn skip(&mut self, reason: String) {
        self.status = TaskStatus::Skipped;
        self.error = Some(reason);
        self.exit_code = Some(EXIT_SKIPPED);
        self.duration = Some(Duration::ZERO);
    }

    fn finish(&mut self, elapsed: Duration) {
        self.end_time = Some(Utc::now());
        self.duration = Some(elapsed);
    }

    pub fn to_result(&self) -> TaskResult {
        let status = match self.status {
            TaskStatus::Completed => ResultStatus::Success,
            TaskStatus::Skipped => ResultStatus::Skipped,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Failed => ResultStatus::Failed,
        };
        TaskResult {
            status,
            output: self.result.clone(),
            error: self.error.clone(),
            duration: self.duration.unwrap_or_default(),
            exit_code: self.exit_code.unwrap_or(match status {
                ResultStatus::Success => 0,
                _ => crate::EXIT_FAILURE,
            }),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("status", &self.status)
            .field("exit_code", &self.exit_code)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> Task {
        Task::from_fn(name, |_ctx, _params| async { Ok(TaskReport::success(json!(null))) })
    }

    #[test]
    fn dependencies_are_deduplicated() {
        let task = noop("b").depends_on("a").with_dependencies(["a", "c"]);
        assert_eq!(task.dependencies, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn semantic_failure_is_reported_as_failed() {
        let mut task = noop("build");
        task.mark_running();
        task.complete(TaskReport::failure("make exited 2", 2), Duration::from_millis(5));

        let result = task.to_result();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.error.as_deref(), Some("make exited 2"));
    }

    #[test]
    fn result_serializes_duration_as_seconds() {
        let mut task = noop("a");
        task.mark_running();
        task.complete(TaskReport::success(json!({"rows": 3})), Duration::from_millis(1500));

        let value = serde_json::to_value(task.to_result()).unwrap();
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["duration"], json!(1.5));
        assert_eq!(value["exit_code"], json!(0));
        assert_eq!(value["output"]["rows"], json!(3));
    }

    #[tokio::test]
    async fn fn_operation_receives_parameters() {
        let task = Task::from_fn("echo", |_ctx, params| async move {
            Ok(TaskReport::success(params.get("msg").cloned().unwrap_or_default()))
        })
        .with_parameter("msg", "hi");

        let report = task
            .operation
            .execute(CancellationToken::new(), &task.parameters)
            .await
            .unwrap();
        assert_eq!(report.output, Some(json!("hi")));
    }
}
