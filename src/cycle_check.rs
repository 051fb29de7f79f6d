use std::collections::{HashMap, HashSet};
use crate::Task;

/// Returns the first dependency cycle found, as a path that starts and ends
/// on the same task name (`a -> b -> a`). Dependencies naming tasks outside
/// the given set are ignored.
pub fn find_cycle<'a, I>(tasks: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a Task>,
{
    let tasks: Vec<&'a Task> = tasks.into_iter().collect();
    let index: HashMap<&'a str, &'a Task> =
        tasks.iter().map(|&task| (task.name.as_str(), task)).collect();

    let mut visited = HashSet::new();
    let mut path = Vec::new();

    fn dfs<'a>(
        name: &'a str,
        index: &HashMap<&'a str, &'a Task>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|step| *step == name) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|step| step.to_string()).collect();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if !visited.insert(name) {
            return None;
        }

        path.push(name);
        if let Some(&task) = index.get(name) {
            for dep in &task.dependencies {
                if let Some(cycle) = dfs(dep.as_str(), index, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    for &task in &tasks {
        if let Some(cycle) = dfs(task.name.as_str(), &index, &mut visited, &mut path) {
            return Some(cycle);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskReport;

    fn task(name: &str, deps: &[&str]) -> Task {
        Task::from_fn(name, |_ctx, _params| async { Ok(TaskReport::success(0)) })
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["a", "b"])];
        assert_eq!(find_cycle(&tasks), None);
    }

    #[test]
    fn two_cycle_is_reported_as_path() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        assert_eq!(
            find_cycle(&tasks),
            Some(vec!["a".to_string(), "b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task("solo", &["solo"])];
        assert_eq!(
            find_cycle(&tasks),
            Some(vec!["solo".to_string(), "solo".to_string()])
        );
    }

    #[test]
    fn cycle_behind_acyclic_prefix_is_found() {
        let tasks = vec![
            task("root", &[]),
            task("x", &["root", "z"]),
            task("y", &["x"]),
            task("z", &["y"]),
        ];
        let cycle = find_cycle(&tasks).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }
}
