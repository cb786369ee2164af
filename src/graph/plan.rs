use super::task::{TaskKind, TaskNode, Work};
use super::taskflow::GraphInner;
use crate::error::{Error, Result};
use std::sync::Arc;

/// One task as seen by a single run.
pub(crate) struct PlannedTask {
    pub(crate) name: String,
    pub(crate) work: Work,
    pub(crate) successors: Vec<usize>,
    pub(crate) num_predecessors: usize,
}

impl PlannedTask {
    pub(crate) fn kind(&self) -> TaskKind {
        self.work.kind()
    }
}

/// Immutable snapshot of a taskflow taken when a run starts.
pub(crate) struct Plan {
    pub(crate) graph_name: String,
    pub(crate) tasks: Vec<PlannedTask>,
    pub(crate) roots: Vec<usize>,
}

impl Plan {
    pub(crate) fn build(graph_name: &str, nodes: &[TaskNode]) -> Result<Self> {
        check_acyclic(nodes)?;

        let tasks = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| PlannedTask {
                name: node.display_name(index),
                work: node.work.clone(),
                successors: node.successors.clone(),
                num_predecessors: node.predecessors.len(),
            })
            .collect::<Vec<_>>();

        let roots = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.num_predecessors == 0)
            .map(|(index, _)| index)
            .collect();

        Ok(Self {
            graph_name: graph_name.to_string(),
            tasks,
            roots,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn num_device_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.kind() == TaskKind::Device)
            .count()
    }
}

/// Keeps the taskflow frozen until the run it belongs to has finished.
pub(crate) struct RunGuard {
    graph: Arc<GraphInner>,
}

impl RunGuard {
    pub(crate) fn new(graph: Arc<GraphInner>) -> Self {
        Self { graph }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.graph.end_run();
    }
}

pub(crate) fn check_acyclic(nodes: &[TaskNode]) -> Result<()> {
    match find_cycle(nodes) {
        Some(index) => Err(Error::CyclicGraph {
            task: nodes[index].display_name(index),
        }),
        None => Ok(()),
    }
}

/// Kahn's algorithm. Returns a task lying on a cycle, if any.
fn find_cycle(nodes: &[TaskNode]) -> Option<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|node| node.predecessors.len()).collect();
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;

    while let Some(index) = ready.pop() {
        visited += 1;
        for &succ in &nodes[index].successors {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(succ);
            }
        }
    }

    if visited == nodes.len() {
        return None;
    }

    // Every unvisited task has an unvisited predecessor, so walking those
    // backwards must revisit a task, and that task is on a cycle.
    let mut seen = vec![false; nodes.len()];
    let mut current = (0..nodes.len()).find(|&i| in_degree[i] > 0)?;
    while !seen[current] {
        seen[current] = true;
        current = nodes[current]
            .predecessors
            .iter()
            .copied()
            .find(|&pred| in_degree[pred] > 0)?;
    }
    Some(current)
}
