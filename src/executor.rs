use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CircuitBreaker, CoreError, CoreResult, EXIT_FAILURE, EXIT_TIMEOUT, ExecutionPlan,
    OperationError, Operation, SchedulerConfig, Task, TaskInput, TaskReport, TaskResult,
};

/// What `execute_with_dependencies` does with tasks whose prerequisites failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Run every batch regardless of earlier outcomes.
    #[default]
    RunAnyway,
    /// Record dependents of failed or skipped tasks as skipped.
    Skip,
}

/// Runs task sets with bounded concurrency, per-task timeouts and failure
/// isolation.
#[derive(Debug, Clone, Default)]
pub struct ParallelScheduler {
    config: SchedulerConfig,
}

impl ParallelScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn build_execution_plan(&self, tasks: Vec<Task>) -> CoreResult<ExecutionPlan> {
        ExecutionPlan::build(tasks)
    }

    /// Runs `tasks` concurrently with no ordering between them and returns one
    /// result per task name.
    ///
    /// At most `max_concurrency` tasks (the configured default when `None`)
    /// run at once; the limit applies to this call only. With `fail_fast`, the
    /// first task that raises or times out aborts the rest and its error is
    /// returned instead of a result map.
    pub async fn execute_parallel(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
        max_concurrency: Option<usize>,
        fail_fast: bool,
    ) -> CoreResult<HashMap<String, TaskResult>> {
        let finished = self.run_parallel(ctx, tasks, max_concurrency, fail_fast).await?;
        Ok(finished
            .into_iter()
            .map(|task| (task.name.clone(), task.to_result()))
            .collect())
    }

    /// Same as [`execute_parallel`](Self::execute_parallel) but hands back the
    /// finished tasks with their runtime fields filled in, in completion order.
    pub async fn run_parallel(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
        max_concurrency: Option<usize>,
        fail_fast: bool,
    ) -> CoreResult<Vec<Task>> {
        let mut names = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !names.insert(task.name.as_str()) {
                return Err(CoreError::DuplicateTask(task.name.clone()));
            }
        }
        drop(names);

        let limit = max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut finished = Vec::with_capacity(tasks.len());
        let mut set = JoinSet::new();

        debug!(tasks = tasks.len(), limit, fail_fast, "Starting parallel execution");
        for task in tasks {
            set.spawn(Self::run_task(
                task,
                ctx.clone(),
                semaphore.clone(),
                self.config.default_timeout,
                fail_fast,
            ));
        }

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(task))) => finished.push(task),
                    Some(Ok(Err(e))) => {
                        set.abort_all();
                        warn!(error = %e, "Aborting parallel execution");
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        set.abort_all();
                        return Err(CoreError::TaskExecution(format!("Join error: {}", e)));
                    }
                },
                _ = ctx.cancelled() => {
                    set.abort_all();
                    return Err(CoreError::ContextCancelled("Execution cancelled".to_string()));
                }
            }
        }

        Ok(finished)
    }

    /// Builds an execution plan and runs it batch by batch. A batch starts
    /// only after every task of the previous batch has finished; failures
    /// inside a batch never stop later batches unless the scheduler is set to
    /// [`DependencyFailurePolicy::Skip`].
    pub async fn execute_with_dependencies(
        &self,
        ctx: CancellationToken,
        tasks: Vec<Task>,
    ) -> CoreResult<HashMap<String, TaskResult>> {
        let plan = self.build_execution_plan(tasks)?;
        info!(
            batches = plan.batch_count(),
            tasks = plan.task_count(),
            "Executing dependency plan"
        );

        let mut results: HashMap<String, TaskResult> = HashMap::with_capacity(plan.task_count());
        for (index, batch) in plan.into_batches().into_iter().enumerate() {
            let mut runnable = Vec::with_capacity(batch.len());
            for mut task in batch {
                match self.blocking_dependency(&task, &results) {
                    Some(dep) => {
                        task.skip(format!("dependency '{dep}' did not succeed"));
                        info!(task = %task.name, dependency = %dep, "Skipping task");
                        results.insert(task.name.clone(), task.to_result());
                    }
                    None => runnable.push(task),
                }
            }

            info!(batch = index, tasks = runnable.len(), "Starting batch");
            let finished = self.run_parallel(ctx.clone(), runnable, None, false).await?;
            let failed = finished.iter().filter(|t| !t.to_result().is_success()).count();
            for task in finished {
                results.insert(task.name.clone(), task.to_result());
            }
            info!(batch = index, failed, "Batch complete");
        }

        Ok(results)
    }

    fn blocking_dependency(
        &self,
        task: &Task,
        results: &HashMap<String, TaskResult>,
    ) -> Option<String> {
        if self.config.dependency_failure != DependencyFailurePolicy::Skip {
            return None;
        }
        task.dependencies
            .iter()
            .find(|dep| results.get(*dep).is_some_and(|r| !r.is_success()))
            .cloned()
    }

    async fn run_task(
        mut task: Task,
        ctx: CancellationToken,
        semaphore: Arc<Semaphore>,
        default_timeout: Duration,
        fail_fast: bool,
    ) -> CoreResult<Task> {
        let _permit = semaphore.acquire_owned().await.map_err(|_| {
            CoreError::TaskExecution("Failed to acquire semaphore".to_string())
        })?;

        let timeout = task.timeout.unwrap_or(default_timeout);
        let op_ctx = ctx.child_token();
        task.mark_running();
        debug!(task = %task.name, ?timeout, "Task started");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(Self::invoke(&task, op_ctx.clone())).catch_unwind(),
        )
        .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(report))) => {
                debug!(task = %task.name, status = ?report.status, ?elapsed, "Task finished");
                task.complete(report, elapsed);
            }
            Ok(Ok(Err(err))) => {
                warn!(task = %task.name, error = %err, "Task failed");
                if fail_fast {
                    return Err(CoreError::TaskFailed {
                        task: task.name,
                        source: err,
                    });
                }
                task.fail(err.to_string(), EXIT_FAILURE, elapsed);
            }
            Ok(Err(panic)) => {
                let err = OperationError::fatal(format!("task panicked: {}", panic_message(panic.as_ref())));
                warn!(task = %task.name, error = %err, "Task panicked");
                if fail_fast {
                    return Err(CoreError::TaskFailed {
                        task: task.name,
                        source: err,
                    });
                }
                task.fail(err.to_string(), EXIT_FAILURE, elapsed);
            }
            Err(_) => {
                op_ctx.cancel();
                warn!(task = %task.name, ?timeout, "Task timed out");
                if fail_fast {
                    return Err(CoreError::TaskTimeout {
                        task: task.name,
                        timeout,
                    });
                }
                task.fail(
                    format!("Task timed out after {:.1}s", timeout.as_secs_f64()),
                    EXIT_TIMEOUT,
                    elapsed,
                );
            }
        }

        Ok(task)
    }

    /// One supervised invocation: through the task's error handler and circuit
    /// breaker when it has them.
    async fn invoke(task: &Task, ctx: CancellationToken) -> Result<TaskReport, OperationError> {
        let breaker = task.circuit_breaker.as_deref();
        match &task.error_handler {
            Some(handler) => {
                handler
                    .with_retry(&task.name, |_attempt| {
                        Self::attempt(task.operation.as_ref(), &task.parameters, ctx.clone(), breaker)
                    })
                    .await
            }
            None => Self::attempt(task.operation.as_ref(), &task.parameters, ctx, breaker).await,
        }
    }

    async fn attempt(
        operation: &dyn Operation,
        params: &TaskInput,
        ctx: CancellationToken,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<TaskReport, OperationError> {
        match breaker {
            Some(breaker) => Ok(breaker
                .call(|| Self::lifecycle(operation, params, ctx))
                .await?),
            None => Self::lifecycle(operation, params, ctx).await,
        }
    }

    async fn lifecycle(
        operation: &dyn Operation,
        params: &TaskInput,
        ctx: CancellationToken,
    ) -> Result<TaskReport, OperationError> {
        operation.pre_execution(ctx.clone(), params).await?;
        let report = operation.execute(ctx.clone(), params).await?;
        operation.post_execution(ctx, &report).await?;
        Ok(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResultStatus;
    use serde_json::json;

    fn sleeper(name: &str, ms: u64) -> Task {
        Task::from_fn(name, move |_ctx, _params| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(TaskReport::success(json!(ms)))
        })
    }

    #[tokio::test]
    async fn empty_input_returns_empty_map() {
        let scheduler = ParallelScheduler::default();
        let results = scheduler
            .execute_parallel(CancellationToken::new(), Vec::new(), None, false)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let scheduler = ParallelScheduler::default();
        let err = scheduler
            .execute_parallel(
                CancellationToken::new(),
                vec![sleeper("a", 1), sleeper("a", 1)],
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateTask(name) if name == "a"));
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_clamped() {
        let scheduler = ParallelScheduler::default();
        let results = tokio::spawn(async move {
            scheduler
                .execute_parallel(
                    CancellationToken::new(),
                    vec![sleeper("a", 1), sleeper("b", 1)],
                    Some(usize::MAX),
                    false,
                )
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert!(results.values().all(TaskResult::is_success));
    }

    #[tokio::test]
    async fn runtime_fields_are_populated() {
        let scheduler = ParallelScheduler::default();
        let finished = scheduler
            .run_parallel(CancellationToken::new(), vec![sleeper("a", 5)], None, false)
            .await
            .unwrap();
        let task = &finished[0];
        assert_eq!(task.status, crate::TaskStatus::Completed);
        assert!(task.start_time.is_some() && task.end_time.is_some());
        assert!(task.duration.unwrap() >= Duration::from_millis(5));
        assert_eq!(task.result, Some(json!(5)));
    }

    #[tokio::test]
    async fn panicking_task_is_isolated() {
        let scheduler = ParallelScheduler::default();
        let boom = Task::from_fn("boom", |_ctx, _params| async {
            if true {
                panic!("kaboom");
            }
            Ok(TaskReport::success(0))
        });
        let results = scheduler
            .execute_parallel(CancellationToken::new(), vec![boom, sleeper("ok", 1)], None, false)
            .await
            .unwrap();

        assert_eq!(results["boom"].status, ResultStatus::Failed);
        assert_eq!(results["boom"].exit_code, EXIT_FAILURE);
        assert!(results["boom"].error.as_deref().unwrap().contains("kaboom"));
        assert!(results["ok"].is_success());
    }

    #[tokio::test]
    async fn lifecycle_hooks_wrap_execute() {
        use async_trait::async_trait;
        use std::sync::Mutex;

        struct Recorder(Arc<Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl Operation for Recorder {
            async fn pre_execution(
                &self,
                _ctx: CancellationToken,
                _params: &TaskInput,
            ) -> Result<(), OperationError> {
                self.0.lock().unwrap().push("pre");
                Ok(())
            }

            async fn execute(
                &self,
                _ctx: CancellationToken,
                _params: &TaskInput,
            ) -> Result<TaskReport, OperationError> {
                self.0.lock().unwrap().push("execute");
                Ok(TaskReport::success("done"))
            }

            async fn post_execution(
                &self,
                _ctx: CancellationToken,
                report: &TaskReport,
            ) -> Result<(), OperationError> {
                assert_eq!(report.output, Some(json!("done")));
                self.0.lock().unwrap().push("post");
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = ParallelScheduler::default();
        let results = scheduler
            .execute_parallel(
                CancellationToken::new(),
                vec![Task::new("hooks", Recorder(log.clone()))],
                None,
                false,
            )
            .await
            .unwrap();

        assert!(results["hooks"].is_success());
        assert_eq!(*log.lock().unwrap(), vec!["pre", "execute", "post"]);
    }

    #[tokio::test]
    async fn timeout_cancels_operation_token() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let task = Task::from_fn("stuck", move |ctx, _params| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(ctx);
                }
                std::future::pending::<()>().await;
                Ok(TaskReport::success(0))
            }
        })
        .with_timeout(Duration::from_millis(20));

        let scheduler = ParallelScheduler::default();
        let results = scheduler
            .execute_parallel(CancellationToken::new(), vec![task], None, false)
            .await
            .unwrap();

        assert_eq!(results["stuck"].exit_code, EXIT_TIMEOUT);
        assert!(rx.await.unwrap().is_cancelled());
    }
}
