//! Task graph arena built from the persisted task list.
//!
//! Parent/child links and dependency edges are materialized once, so leaf
//! checks, dependency expansion and dependent lookups are index operations
//! instead of repeated scans over dotted ids.

use crate::errors::{EngineError, EngineResult};
use crate::task::Task;
use std::collections::{HashMap, HashSet, VecDeque};

/// Index into the task list the graph was built from.
pub type TaskIndex = usize;

/// Hierarchy and dependency structure of a task list.
///
/// Indices match the positions of the tasks in the slice passed to
/// [`TaskGraph::build`], so callers can use them to address the same tasks
/// in the state document.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    ids: Vec<String>,
    index_map: HashMap<String, TaskIndex>,
    /// Whether the task declares subtasks (even unknown ones)
    has_subtasks: Vec<bool>,
    parent: Vec<Option<TaskIndex>>,
    children: Vec<Vec<TaskIndex>>,
    /// Declared dependency ids, as written
    declared: Vec<Vec<String>>,
    /// Expanded dependencies resolved to known tasks: index -> tasks it waits on
    reverse_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks waiting on it
    forward_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build the graph.
    ///
    /// Fails only on duplicate task ids; dangling references are kept so
    /// that validation can report them.
    pub fn build(tasks: &[Task]) -> EngineResult<Self> {
        let mut index_map = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index_map.insert(task.task_id.clone(), i).is_some() {
                return Err(EngineError::validation(
                    format!("tasks[{}].task_id", i),
                    format!("Duplicate task id: {}", task.task_id),
                ));
            }
        }

        let n = tasks.len();
        let mut parent: Vec<Option<TaskIndex>> = vec![None; n];
        let mut children: Vec<Vec<TaskIndex>> = vec![Vec::new(); n];

        for (i, task) in tasks.iter().enumerate() {
            for sub in &task.subtasks {
                if let Some(&child) = index_map.get(sub)
                    && child != i
                {
                    children[i].push(child);
                    if parent[child].is_none() {
                        parent[child] = Some(i);
                    }
                }
            }
        }
        for (i, task) in tasks.iter().enumerate() {
            if parent[i].is_none()
                && let Some(pid) = &task.parent_id
                && let Some(&p) = index_map.get(pid)
                && p != i
            {
                parent[i] = Some(p);
            }
        }

        let mut graph = Self {
            ids: tasks.iter().map(|t| t.task_id.clone()).collect(),
            index_map,
            has_subtasks: tasks.iter().map(|t| !t.subtasks.is_empty()).collect(),
            parent,
            children,
            declared: tasks.iter().map(|t| t.dependencies.clone()).collect(),
            reverse_edges: vec![Vec::new(); n],
            forward_edges: vec![Vec::new(); n],
        };

        for i in 0..n {
            let expanded = graph.expand_dependencies(&graph.declared[i]);
            let deps: Vec<TaskIndex> = expanded
                .iter()
                .filter_map(|id| graph.index_map.get(id).copied())
                .collect();
            for &dep in &deps {
                graph.forward_edges[dep].push(i);
            }
            graph.reverse_edges[i] = deps;
        }

        Ok(graph)
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: TaskIndex) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, task_id: &str) -> Option<TaskIndex> {
        self.index_map.get(task_id).copied()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index_map.contains_key(task_id)
    }

    /// A task with no subtasks.
    pub fn is_leaf(&self, index: TaskIndex) -> bool {
        !self.has_subtasks[index]
    }

    pub fn parent(&self, index: TaskIndex) -> Option<TaskIndex> {
        self.parent[index]
    }

    /// Direct children in subtask order.
    pub fn children(&self, index: TaskIndex) -> &[TaskIndex] {
        &self.children[index]
    }

    /// Dependency ids exactly as declared on the task.
    pub fn declared_dependencies(&self, index: TaskIndex) -> &[String] {
        &self.declared[index]
    }

    /// Known tasks this task waits on, after parent expansion.
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        &self.reverse_edges[index]
    }

    /// Tasks that wait directly on this task, after parent expansion.
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        &self.forward_edges[index]
    }

    /// Leaf descendants of a task in depth-first child order.
    ///
    /// A leaf is its own only descendant.
    pub fn leaf_descendants(&self, index: TaskIndex) -> Vec<TaskIndex> {
        let mut leaves = Vec::new();
        let mut visited = HashSet::new();
        self.collect_leaves(index, &mut visited, &mut leaves);
        leaves
    }

    fn collect_leaves(
        &self,
        index: TaskIndex,
        visited: &mut HashSet<TaskIndex>,
        leaves: &mut Vec<TaskIndex>,
    ) {
        if !visited.insert(index) {
            return;
        }
        if self.children[index].is_empty() {
            if self.is_leaf(index) {
                leaves.push(index);
            }
            return;
        }
        for &child in &self.children[index] {
            self.collect_leaves(child, visited, leaves);
        }
    }

    /// Replace every parent id with its leaf descendants.
    ///
    /// Leaf ids and unknown ids pass through unchanged. The result keeps
    /// first-appearance order and holds no duplicates.
    pub fn expand_dependencies(&self, ids: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut expanded = Vec::new();

        for id in ids {
            match self.index_of(id) {
                Some(index) if !self.is_leaf(index) => {
                    for leaf in self.leaf_descendants(index) {
                        if seen.insert(self.ids[leaf].as_str()) {
                            expanded.push(self.ids[leaf].clone());
                        }
                    }
                }
                _ => {
                    if seen.insert(id.as_str()) {
                        expanded.push(id.clone());
                    }
                }
            }
        }

        expanded
    }

    /// Every task that depends on `index`, directly or transitively.
    ///
    /// Returned in task order; never contains `index` itself.
    pub fn dependents_of(&self, index: TaskIndex) -> Vec<TaskIndex> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<TaskIndex> = self.forward_edges[index].iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if next == index || !visited.insert(next) {
                continue;
            }
            queue.extend(self.forward_edges[next].iter().copied());
        }

        let mut result: Vec<TaskIndex> = visited.into_iter().collect();
        result.sort_unstable();
        result
    }

    /// Depth of a task in the hierarchy (roots are 0).
    pub fn depth(&self, index: TaskIndex) -> usize {
        let mut depth = 0;
        let mut current = self.parent[index];
        while let Some(p) = current {
            depth += 1;
            if depth > self.len() {
                break;
            }
            current = self.parent[p];
        }
        depth
    }

    /// Tasks with subtasks, deepest first.
    pub fn parents_deepest_first(&self) -> Vec<TaskIndex> {
        let mut parents: Vec<TaskIndex> = (0..self.len()).filter(|&i| !self.is_leaf(i)).collect();
        parents.sort_by_key(|&i| std::cmp::Reverse(self.depth(i)));
        parents
    }
}
