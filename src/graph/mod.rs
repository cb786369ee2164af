//! The host-level task graph.
//!
//! A [`Taskflow`] owns host and device tasks plus the dependency edges
//! between them. Running one is the executor's job; this module only builds
//! the graph, checks it for cycles and snapshots it per run.

mod plan;
mod task;
mod taskflow;

pub(crate) use plan::{Plan, RunGuard};
pub(crate) use task::Work;
pub use task::{Task, TaskKind};
pub use taskflow::Taskflow;
