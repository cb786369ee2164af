use super::taskflow::GraphInner;
use crate::device::cache::DeviceGraphCache;
use crate::device::DeviceFlow;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub(crate) type HostWork = Arc<dyn Fn() -> Result<()> + Send + Sync>;
pub(crate) type DeviceWork = Arc<dyn Fn(&mut DeviceFlow) -> Result<()> + Send + Sync>;

/// Which worker pool a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Host,
    Device,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Host => write!(f, "host"),
            TaskKind::Device => write!(f, "device"),
        }
    }
}

#[derive(Clone)]
pub(crate) enum Work {
    Host(HostWork),
    Device {
        build: DeviceWork,
        cache: Arc<Mutex<DeviceGraphCache>>,
    },
}

impl Work {
    pub(crate) fn device<F>(build: F) -> Self
    where
        F: Fn(&mut DeviceFlow) -> Result<()> + Send + Sync + 'static,
    {
        Work::Device {
            build: Arc::new(build),
            cache: Arc::new(Mutex::new(DeviceGraphCache::new())),
        }
    }

    pub(crate) fn kind(&self) -> TaskKind {
        match self {
            Work::Host(_) => TaskKind::Host,
            Work::Device { .. } => TaskKind::Device,
        }
    }
}

pub(crate) struct TaskNode {
    pub(crate) name: String,
    pub(crate) work: Work,
    pub(crate) successors: Vec<usize>,
    pub(crate) predecessors: Vec<usize>,
}

impl TaskNode {
    pub(crate) fn new(work: Work) -> Self {
        Self {
            name: String::new(),
            work,
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    /// Name used in errors and logs; unnamed tasks fall back to their index.
    pub(crate) fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("task#{}", index)
        } else {
            self.name.clone()
        }
    }
}

/// Handle to a task inside a [`Taskflow`](super::Taskflow).
///
/// Handles are cheap to clone and stay valid for as long as any handle or the
/// taskflow itself is alive.
#[derive(Clone)]
pub struct Task {
    graph: Arc<GraphInner>,
    index: usize,
}

impl Task {
    pub(crate) fn new(graph: Arc<GraphInner>, index: usize) -> Self {
        Self { graph, index }
    }

    /// Make this task run before every task in `others`.
    pub fn precede<'a, I>(&self, others: I) -> Result<&Self>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let edges = self.collect_edges(others, |other| (self.index, other.index))?;
        self.graph.add_edges(&edges)?;
        Ok(self)
    }

    /// Make this task run after every task in `others`.
    pub fn succeed<'a, I>(&self, others: I) -> Result<&Self>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let edges = self.collect_edges(others, |other| (other.index, self.index))?;
        self.graph.add_edges(&edges)?;
        Ok(self)
    }

    fn collect_edges<'a, I, F>(&self, others: I, edge: F) -> Result<Vec<(usize, usize)>>
    where
        I: IntoIterator<Item = &'a Task>,
        F: Fn(&Task) -> (usize, usize),
    {
        others
            .into_iter()
            .map(|other| {
                if Arc::ptr_eq(&self.graph, &other.graph) {
                    Ok(edge(other))
                } else {
                    Err(Error::invalid_argument(format!(
                        "cannot link {} to a task of another taskflow",
                        self.get_name()
                    )))
                }
            })
            .collect()
    }

    /// Set a display name. Names show up in errors and trace output.
    pub fn name<S: Into<String>>(&self, name: S) -> &Self {
        self.graph.nodes.write()[self.index].name = name.into();
        self
    }

    pub fn get_name(&self) -> String {
        self.graph.nodes.read()[self.index].display_name(self.index)
    }

    pub fn kind(&self) -> TaskKind {
        self.graph.nodes.read()[self.index].work.kind()
    }

    pub fn is_device(&self) -> bool {
        self.kind() == TaskKind::Device
    }

    pub fn num_successors(&self) -> usize {
        self.graph.nodes.read()[self.index].successors.len()
    }

    pub fn num_predecessors(&self) -> usize {
        self.graph.nodes.read()[self.index].predecessors.len()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.graph, &other.graph) && self.index == other.index
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.get_name())
            .field("kind", &self.kind())
            .finish()
    }
}
