//! Dependency validation and deterministic ordering.
//!
//! Cycles are searched on the expanded dependency edges, since a dependency
//! on a parent task waits on every one of its leaves. Missing references are
//! reported against the ids as declared.

use crate::dag::builder::{TaskGraph, TaskIndex};
use crate::errors::DependencyError;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Result of [`topological_sort`].
///
/// When `errors` is non-empty `order` is always empty: a partial order is
/// never returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologicalOrder {
    pub order: Vec<String>,
    pub errors: Vec<DependencyError>,
}

impl TopologicalOrder {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Find dependency cycles with a depth-first search.
///
/// Each cycle is recorded as the path from the repeated task back to itself,
/// e.g. `["1", "2", "1"]`. Roots are visited in task order.
pub fn detect_cycles(graph: &TaskGraph) -> Vec<DependencyError> {
    let mut cycles = Vec::new();
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for root in 0..graph.len() {
        if !visited.contains(&root) {
            visit(graph, root, &mut visited, &mut on_stack, &mut path, &mut cycles);
            on_stack.clear();
            path.clear();
        }
    }

    cycles
}

/// Returns true once a cycle has been recorded below `node`.
fn visit(
    graph: &TaskGraph,
    node: TaskIndex,
    visited: &mut HashSet<TaskIndex>,
    on_stack: &mut HashSet<TaskIndex>,
    path: &mut Vec<TaskIndex>,
    cycles: &mut Vec<DependencyError>,
) -> bool {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for &dep in graph.dependencies(node) {
        if !visited.contains(&dep) {
            if visit(graph, dep, visited, on_stack, path, cycles) {
                return true;
            }
        } else if on_stack.contains(&dep) {
            let start = path.iter().position(|&p| p == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..]
                .iter()
                .map(|&i| graph.id(i).to_string())
                .collect();
            cycle.push(graph.id(dep).to_string());
            cycles.push(DependencyError::Circular { cycle });
            return true;
        }
    }

    path.pop();
    on_stack.remove(&node);
    false
}

/// Report, per task, the declared dependency ids that name no known task.
pub fn find_missing_dependencies(graph: &TaskGraph) -> Vec<DependencyError> {
    (0..graph.len())
        .filter_map(|i| {
            let missing: Vec<String> = graph
                .declared_dependencies(i)
                .iter()
                .filter(|dep| !graph.contains(dep))
                .cloned()
                .collect();
            (!missing.is_empty()).then(|| DependencyError::Missing {
                task_id: graph.id(i).to_string(),
                missing,
            })
        })
        .collect()
}

/// All dependency problems in the graph: cycles first, then missing ids.
pub fn check_dependencies(graph: &TaskGraph) -> Vec<DependencyError> {
    let mut errors = detect_cycles(graph);
    errors.extend(find_missing_dependencies(graph));
    errors
}

/// Compare dotted task ids segment by segment, numerically where possible.
///
/// `"2" < "10"` and `"1.2" < "1.10"`; non-numeric segments compare as text.
pub fn compare_task_ids(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Order every task so that it follows all of its dependencies.
///
/// Fails fast: any cycle or missing dependency yields an empty order plus
/// the errors. Ties between ready tasks go to the smallest id.
pub fn topological_sort(graph: &TaskGraph) -> TopologicalOrder {
    let errors = check_dependencies(graph);
    if !errors.is_empty() {
        return TopologicalOrder {
            order: Vec::new(),
            errors,
        };
    }

    let mut in_degree: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(i).len())
        .collect();
    let mut queue: Vec<TaskIndex> = (0..graph.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(graph.len());

    while !queue.is_empty() {
        // Smallest id last so pop() takes it
        queue.sort_by(|&a, &b| compare_task_ids(graph.id(b), graph.id(a)));
        let Some(current) = queue.pop() else {
            break;
        };
        order.push(graph.id(current).to_string());

        for &dependent in graph.dependents(current) {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    TopologicalOrder {
        order,
        errors: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("Task {}", id)).with_dependencies(deps)
    }

    fn graph(tasks: &[Task]) -> TaskGraph {
        TaskGraph::build(tasks).unwrap()
    }

    #[test]
    fn test_simple_cycle_path() {
        let g = graph(&[task("1", &["2"]), task("2", &["1"])]);
        let cycles = detect_cycles(&g);
        assert_eq!(
            cycles,
            vec![DependencyError::Circular {
                cycle: vec!["1".into(), "2".into(), "1".into()]
            }]
        );
    }

    #[test]
    fn test_three_node_cycle() {
        let g = graph(&[task("1", &["3"]), task("2", &["1"]), task("3", &["2"])]);
        let cycles = detect_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0].to_string(),
            "Circular dependency: 1 -> 3 -> 2 -> 1"
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[task("1", &["1"])]);
        assert_eq!(
            detect_cycles(&g)[0].to_string(),
            "Circular dependency: 1 -> 1"
        );
    }

    #[test]
    fn test_cycle_through_parent_expansion() {
        let tasks = vec![
            task("1", &[]).with_subtasks(&["1.1"]),
            task("1.1", &["2"]),
            task("2", &["1"]),
        ];
        let g = graph(&tasks);
        assert_eq!(detect_cycles(&g).len(), 1);
    }

    #[test]
    fn test_acyclic_has_no_cycles() {
        let g = graph(&[task("1", &[]), task("2", &["1"]), task("3", &["1", "2"])]);
        assert!(detect_cycles(&g).is_empty());
    }

    #[test]
    fn test_missing_dependencies_per_task() {
        let g = graph(&[task("1", &["9"]), task("2", &["1", "8", "7"])]);
        let missing = find_missing_dependencies(&g);
        assert_eq!(missing.len(), 2);
        assert_eq!(
            missing[1],
            DependencyError::Missing {
                task_id: "2".into(),
                missing: vec!["8".into(), "7".into()]
            }
        );
    }

    #[test]
    fn test_topological_sort_orders_by_dependencies() {
        let g = graph(&[task("3", &["1", "2"]), task("2", &["1"]), task("1", &[])]);
        let result = topological_sort(&g);
        assert!(result.is_valid());
        assert_eq!(result.order, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_topological_sort_breaks_ties_by_id() {
        let g = graph(&[task("10", &[]), task("2", &[]), task("1", &[]), task("1.10", &[]), task("1.2", &[])]);
        let result = topological_sort(&g);
        assert_eq!(result.order, vec!["1", "1.2", "1.10", "2", "10"]);
    }

    #[test]
    fn test_topological_sort_fails_fast_on_cycle() {
        let g = graph(&[task("1", &[]), task("2", &["3"]), task("3", &["2"])]);
        let result = topological_sort(&g);
        assert!(result.order.is_empty());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_topological_sort_fails_fast_on_missing() {
        let g = graph(&[task("1", &[]), task("2", &["42"])]);
        let result = topological_sort(&g);
        assert!(result.order.is_empty());
        assert!(matches!(result.errors[0], DependencyError::Missing { .. }));
    }

    #[test]
    fn test_compare_task_ids() {
        assert_eq!(compare_task_ids("2", "10"), Ordering::Less);
        assert_eq!(compare_task_ids("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare_task_ids("1", "1.1"), Ordering::Less);
        assert_eq!(compare_task_ids("a", "b"), Ordering::Less);
        assert_eq!(compare_task_ids("3.1", "3.1"), Ordering::Equal);
    }
}
