//! Task graph: hierarchy, dependencies and scheduling order.
//!
//! ## Architecture
//!
//! 1. **Builder** - Materializes an arena ([`TaskGraph`]) from the task list
//! 2. **Deps** - Extracts dependency ids from free-text annotations
//! 3. **Validate** - Cycle and missing-dependency detection, topological order
//! 4. **Scheduler** - Computes the set of ready leaf tasks
//!
//! ## Example
//!
//! ```
//! use foreman::dag::{DependencyMode, TaskGraph, schedule, topological_sort};
//! use foreman::task::Task;
//!
//! let tasks = vec![
//!     Task::new("1", "Schema").with_subtasks(&["1.1", "1.2"]),
//!     Task::new("1.1", "Tables"),
//!     Task::new("1.2", "Indexes"),
//!     Task::new("2", "API").with_dependencies(&["1"]),
//! ];
//!
//! let graph = TaskGraph::build(&tasks).unwrap();
//! assert_eq!(graph.expand_dependencies(&["1".to_string()]), vec!["1.1", "1.2"]);
//!
//! let ready = schedule(&tasks, DependencyMode::Strict).unwrap();
//! assert_eq!(ready.len(), 2); // 1.1 and 1.2; task 2 waits for both
//!
//! assert!(topological_sort(&graph).is_valid());
//! ```

mod builder;
mod deps;
mod scheduler;
mod validate;

pub use builder::{TaskGraph, TaskIndex};
pub use deps::extract_dependencies;
pub use scheduler::{DependencyMode, completed_ids, ready_tasks, schedule};
pub use validate::{
    TopologicalOrder, check_dependencies, compare_task_ids, detect_cycles,
    find_missing_dependencies, topological_sort,
};
