use std::collections::HashSet;

use tracing::debug;

use crate::{CoreError, CoreResult, Task, find_cycle};

/// Tasks grouped into batches that can run one after another. Every task in a
/// batch has all of its dependencies in an earlier batch.
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    batches: Vec<Vec<Task>>,
}

impl ExecutionPlan {
    /// Builds the plan by repeatedly taking every task whose dependencies are
    /// already placed. The whole ready set becomes one batch, ordered by
    /// priority (highest first, ties in submission order).
    pub fn build(tasks: Vec<Task>) -> CoreResult<Self> {
        let mut names = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !names.insert(task.name.clone()) {
                return Err(CoreError::DuplicateTask(task.name.clone()));
            }
        }
        for task in &tasks {
            if let Some(dep) = task.dependencies.iter().find(|dep| !names.contains(*dep)) {
                return Err(CoreError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut pending: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
        let mut remaining = pending.len();
        let mut placed: HashSet<String> = HashSet::with_capacity(remaining);
        let mut batches = Vec::new();

        while remaining > 0 {
            let ready: Vec<usize> = pending
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    slot.as_ref()
                        .filter(|task| task.dependencies.iter().all(|dep| placed.contains(dep)))
                        .map(|_| idx)
                })
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&Task> = pending.iter().flatten().collect();
                let cycle = find_cycle(stuck.iter().copied())
                    .unwrap_or_else(|| stuck.iter().map(|task| task.name.clone()).collect());
                return Err(CoreError::CircularDependency { cycle });
            }

            let mut batch: Vec<Task> = ready
                .into_iter()
                .filter_map(|idx| pending[idx].take())
                .collect();
            batch.sort_by(|a, b| b.priority.cmp(&a.priority));

            for task in &batch {
                placed.insert(task.name.clone());
            }
            remaining -= batch.len();
            debug!(
                batch = batches.len(),
                tasks = ?batch.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                "Planned batch"
            );
            batches.push(batch);
        }

        Ok(Self { batches })
    }

    pub fn batches(&self) -> &[Vec<Task>] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<Vec<Task>> {
        self.batches
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn batch_names(&self) -> Vec<Vec<String>> {
        self.batches
            .iter()
            .map(|batch| batch.iter().map(|task| task.name.clone()).collect())
            .collect()
    }

    pub fn batch_index_of(&self, name: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|task| task.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskReport;
    use pretty_assertions::assert_eq;

    fn task(name: &str, deps: &[&str]) -> Task {
        Task::from_fn(name, |_ctx, _params| async { Ok(TaskReport::success(0)) })
            .with_dependencies(deps.iter().copied())
    }

    fn names(batch: &[&str]) -> Vec<String> {
        batch.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diamond_is_split_into_three_batches() {
        let plan = ExecutionPlan::build(vec![
            task("fetch", &[]),
            task("parse", &["fetch"]),
            task("lint", &["fetch"]),
            task("report", &["parse", "lint"]),
        ])
        .unwrap();

        assert_eq!(
            plan.batch_names(),
            vec![names(&["fetch"]), names(&["parse", "lint"]), names(&["report"])]
        );
        assert_eq!(plan.task_count(), 4);
    }

    #[test]
    fn every_dependency_lands_in_an_earlier_batch() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &[]),
            task("d", &["b", "c"]),
            task("e", &["a"]),
            task("f", &["a", "d", "e"]),
        ];
        let deps: Vec<(String, Vec<String>)> = tasks
            .iter()
            .map(|t| (t.name.clone(), t.dependencies.clone()))
            .collect();

        let plan = ExecutionPlan::build(tasks).unwrap();
        assert_eq!(plan.task_count(), 6);
        for (name, task_deps) in deps {
            let idx = plan.batch_index_of(&name).unwrap();
            for dep in task_deps {
                assert!(plan.batch_index_of(&dep).unwrap() < idx, "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn ready_set_is_ordered_by_priority_without_splitting() {
        let plan = ExecutionPlan::build(vec![
            task("low", &[]).with_priority(1),
            task("high", &[]).with_priority(10),
            task("mid_a", &[]).with_priority(5),
            task("mid_b", &[]).with_priority(5),
        ])
        .unwrap();

        assert_eq!(plan.batch_count(), 1);
        assert_eq!(plan.batch_names()[0], names(&["high", "mid_a", "mid_b", "low"]));
    }

    #[test]
    fn two_cycle_fails_plan_construction() {
        let err = ExecutionPlan::build(vec![task("a", &["b"]), task("b", &["a"])]).unwrap_err();
        match err {
            CoreError::CircularDependency { cycle } => {
                assert_eq!(cycle, names(&["a", "b", "a"]));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_after_valid_prefix_fails() {
        let err = ExecutionPlan::build(vec![
            task("ok", &[]),
            task("x", &["ok", "y"]),
            task("y", &["x"]),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::CircularDependency { .. }));
        assert!(err.to_string().contains("x -> y -> x"));
    }

    #[test]
    fn duplicate_and_unknown_names_are_rejected() {
        let dup = ExecutionPlan::build(vec![task("a", &[]), task("a", &[])]).unwrap_err();
        assert!(matches!(dup, CoreError::DuplicateTask(name) if name == "a"));

        let unknown = ExecutionPlan::build(vec![task("a", &["ghost"])]).unwrap_err();
        assert!(matches!(
            unknown,
            CoreError::UnknownDependency { ref task, ref dependency } if task == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn empty_input_builds_empty_plan() {
        let plan = ExecutionPlan::build(Vec::new()).unwrap();
        assert_eq!(plan.batch_count(), 0);
    }
}
