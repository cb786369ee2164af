use super::plan::{self, Plan, RunGuard};
use super::task::{Task, TaskNode, Work};
use crate::device::DeviceFlow;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_TASKFLOW_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct GraphInner {
    id: u64,
    name: String,
    pub(crate) nodes: RwLock<Vec<TaskNode>>,
    active_runs: AtomicUsize,
}

impl GraphInner {
    /// Apply a structural edit, refusing while any run is in flight.
    ///
    /// The check happens under the write lock and runs register under the
    /// read lock, so an edit never interleaves with a run snapshot.
    fn edit<R>(&self, what: &str, f: impl FnOnce(&mut Vec<TaskNode>) -> R) -> Result<R> {
        let mut nodes = self.nodes.write();
        let active = self.active_runs.load(Ordering::Acquire);
        if active > 0 {
            return Err(Error::illegal_mutation(format!(
                "cannot {} while taskflow '{}' has {} run(s) in flight",
                what, self.name, active
            )));
        }
        Ok(f(&mut nodes))
    }

    pub(crate) fn add_edges(&self, edges: &[(usize, usize)]) -> Result<()> {
        self.edit("add an edge", |nodes| {
            for &(from, to) in edges {
                if nodes[from].successors.contains(&to) {
                    continue;
                }
                nodes[from].successors.push(to);
                nodes[to].predecessors.push(from);
            }
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn end_run(&self) {
        self.active_runs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A directed acyclic graph of host and device tasks.
///
/// Tasks are added through a shared reference; the returned [`Task`] handles
/// wire up dependencies. The same taskflow can be run any number of times,
/// including concurrently, but its structure is frozen while runs are in
/// flight.
///
/// ```
/// use heteroflow::prelude::*;
///
/// # fn main() -> heteroflow::Result<()> {
/// let taskflow = Taskflow::with_name("pipeline");
/// let load = taskflow.emplace(|| println!("load"))?;
/// let save = taskflow.emplace(|| println!("save"))?;
/// load.precede([&save])?;
///
/// assert_eq!(taskflow.len(), 2);
/// taskflow.validate()?;
/// # Ok(())
/// # }
/// ```
pub struct Taskflow {
    inner: Arc<GraphInner>,
}

impl Taskflow {
    pub fn new() -> Self {
        let id = NEXT_TASKFLOW_ID.fetch_add(1, Ordering::Relaxed);
        Self::build(id, format!("taskflow#{}", id))
    }

    pub fn with_name<S: Into<String>>(name: S) -> Self {
        let id = NEXT_TASKFLOW_ID.fetch_add(1, Ordering::Relaxed);
        Self::build(id, name.into())
    }

    fn build(id: u64, name: String) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id,
                name,
                nodes: RwLock::new(Vec::new()),
                active_runs: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Add a host task.
    pub fn emplace<F>(&self, f: F) -> Result<Task>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.emplace_fallible(move || {
            f();
            Ok(())
        })
    }

    /// Add a host task whose failure is reported through its return value.
    pub fn emplace_fallible<F>(&self, f: F) -> Result<Task>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.push(Work::Host(Arc::new(f)))
    }

    /// Add a device task.
    ///
    /// `build` is called on a device worker each time the task runs. The
    /// graph it captures on the first run is instantiated once and replayed
    /// afterwards; later runs must capture the same topology.
    pub fn emplace_device<F>(&self, build: F) -> Result<Task>
    where
        F: Fn(&mut DeviceFlow) -> Result<()> + Send + Sync + 'static,
    {
        self.push(Work::device(build))
    }

    fn push(&self, work: Work) -> Result<Task> {
        let index = self.inner.edit("add a task", |nodes| {
            nodes.push(TaskNode::new(work));
            nodes.len() - 1
        })?;
        Ok(Task::new(self.inner.clone(), index))
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_device_tasks(&self) -> usize {
        self.inner
            .nodes
            .read()
            .iter()
            .filter(|node| matches!(node.work, Work::Device { .. }))
            .count()
    }

    /// Whether any run of this taskflow is still in flight.
    pub fn is_frozen(&self) -> bool {
        self.inner.active_runs.load(Ordering::Acquire) > 0
    }

    /// Check the graph for dependency cycles without running it.
    pub fn validate(&self) -> Result<()> {
        plan::check_acyclic(&self.inner.nodes.read())
    }

    /// Freeze the graph and snapshot it for one run.
    pub(crate) fn begin_run(&self) -> Result<(Plan, RunGuard)> {
        let nodes = self.inner.nodes.read();
        self.inner.active_runs.fetch_add(1, Ordering::AcqRel);
        let guard = RunGuard::new(self.inner.clone());
        let plan = Plan::build(self.inner.name(), &nodes)?;
        Ok((plan, guard))
    }
}

impl Default for Taskflow {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Taskflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Taskflow")
            .field("name", &self.inner.name)
            .field("tasks", &self.len())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
