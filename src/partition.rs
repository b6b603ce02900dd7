//! Conflict-aware batch partitioning.
//!
//! Ready tasks are grouped into ordered batches that are safe to run in
//! parallel: no two tasks in a batch write the same file. Batches must be
//! executed one after another, each to completion (including persisting its
//! results) before the next starts.
//!
//! ## Rules
//!
//! - Only write-write overlaps conflict; reads never do.
//! - Writers are placed first-fit into the earliest batch without a
//!   conflicting member (greedy colouring), else into a new batch.
//! - Read-only tasks join the first batch, or form one if there is none.
//! - Tasks without any manifest run alone, after everything else.
//!
//! ## Example
//!
//! ```
//! use foreman::partition::{detect_conflicts, partition};
//! use foreman::task::Task;
//!
//! let a = Task::new("1", "A").with_writes(&["src/a.py"]);
//! let b = Task::new("2", "B").with_writes(&["src/a.py"]);
//! let tasks = vec![a, b];
//!
//! assert_eq!(detect_conflicts(&tasks).len(), 1);
//! assert_eq!(partition(&tasks).len(), 2);
//! ```

use crate::errors::ConflictWarning;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

/// Two tasks that would write the same files if run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub task_a: String,
    pub task_b: String,
    /// Shared paths, sorted
    pub files: Vec<String>,
    pub conflict_type: String,
}

impl FileConflict {
    pub fn write_write(task_a: &str, task_b: &str, files: Vec<String>) -> Self {
        Self {
            task_a: task_a.to_string(),
            task_b: task_b.to_string(),
            files,
            conflict_type: "write-write".to_string(),
        }
    }

    /// Whether this conflict involves both ids, in either order.
    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.task_a == a && self.task_b == b) || (self.task_a == b && self.task_b == a)
    }

    pub fn to_warning(&self) -> ConflictWarning {
        ConflictWarning {
            task_a: self.task_a.clone(),
            task_b: self.task_b.clone(),
            files: self.files.clone(),
        }
    }
}

/// Every write-write conflict among `tasks`, pairs in input order.
pub fn detect_conflicts(tasks: &[Task]) -> Vec<FileConflict> {
    let refs: Vec<&Task> = tasks.iter().collect();
    detect_conflicts_in(&refs)
}

fn detect_conflicts_in(tasks: &[&Task]) -> Vec<FileConflict> {
    let write_sets: Vec<BTreeSet<&str>> = tasks
        .iter()
        .map(|t| t.writes.iter().map(String::as_str).collect())
        .collect();

    let mut conflicts = Vec::new();
    for i in 0..tasks.len() {
        for j in (i + 1)..tasks.len() {
            let shared: Vec<String> = write_sets[i]
                .intersection(&write_sets[j])
                .map(|f| f.to_string())
                .collect();
            if !shared.is_empty() {
                conflicts.push(FileConflict::write_write(
                    &tasks[i].task_id,
                    &tasks[j].task_id,
                    shared,
                ));
            }
        }
    }
    conflicts
}

/// Split `tasks` into ordered, conflict-free batches.
///
/// Every input task lands in exactly one batch. Conflicts are logged and
/// resolved by serialization; they never abort partitioning.
pub fn partition(tasks: &[Task]) -> Vec<Vec<&Task>> {
    let mut writers: Vec<&Task> = Vec::new();
    let mut readers: Vec<&Task> = Vec::new();
    let mut unmanifested: Vec<&Task> = Vec::new();

    for task in tasks {
        if !task.has_manifest() {
            unmanifested.push(task);
        } else if task.writes.is_empty() {
            readers.push(task);
        } else {
            writers.push(task);
        }
    }

    let conflicts = detect_conflicts_in(&writers);
    for conflict in &conflicts {
        warn!("{}", conflict.to_warning());
    }
    let conflicting: HashSet<(&str, &str)> = conflicts
        .iter()
        .flat_map(|c| {
            [
                (c.task_a.as_str(), c.task_b.as_str()),
                (c.task_b.as_str(), c.task_a.as_str()),
            ]
        })
        .collect();

    let mut batches: Vec<Vec<&Task>> = Vec::new();
    for task in writers {
        let slot = batches.iter().position(|batch| {
            batch
                .iter()
                .all(|member| !conflicting.contains(&(task.task_id.as_str(), member.task_id.as_str())))
        });
        match slot {
            Some(index) => batches[index].push(task),
            None => batches.push(vec![task]),
        }
    }

    if !readers.is_empty() {
        match batches.first_mut() {
            Some(first) => first.extend(readers),
            None => batches.push(readers),
        }
    }

    for task in unmanifested {
        info!(
            task_id = %task.task_id,
            "Task has no file manifest, executing serially for safety"
        );
        batches.push(vec![task]);
    }

    batches
}
