//! foreman: a multi-agent task orchestrator.
//!
//! Tasks parsed from a spec's `tasks.md` live in a JSON state document.
//! Each CLI invocation is one tick over that document: schedule the ready
//! leaf tasks, split them into conflict-free batches, hand them to an
//! external execution backend, then route finished work through review,
//! consolidation and, when a review blocks, the fix loop.

pub mod backend;
pub mod config;
pub mod dag;
pub mod errors;
pub mod init;
pub mod lifecycle;
pub mod orchestrator;
pub mod partition;
pub mod review;
pub mod task;
