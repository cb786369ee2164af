//! Device operation nodes and the intra-builder edge set.

use super::buffer::RawMemory;
use super::geometry::{KernelContext, LaunchGeometry};
use super::DeviceId;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static FLOW_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) type KernelBody = Arc<dyn Fn(&KernelContext) + Send + Sync>;

/// Kind of a device operation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Kernel,
    Copy,
    Fill,
}

/// Byte pattern written by a fill node, one element wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FillPattern {
    bytes: [u8; 4],
    width: usize,
}

impl FillPattern {
    /// Pattern for an element of `value.len()` bytes.
    pub(crate) fn new(value: &[u8]) -> Result<Self> {
        match value.len() {
            1 | 2 | 4 => {
                let mut bytes = [0u8; 4];
                bytes[..value.len()].copy_from_slice(value);
                Ok(Self {
                    bytes,
                    width: value.len(),
                })
            }
            width => Err(Error::UnsupportedFillWidth { width }),
        }
    }

    pub(crate) fn byte(value: u8) -> Self {
        Self {
            bytes: [value, 0, 0, 0],
            width: 1,
        }
    }

    pub(crate) fn width(&self) -> usize {
        self.width
    }

    /// Expand the pattern over `len` bytes.
    pub(crate) fn expand(&self, len: usize) -> Vec<u8> {
        let element = &self.bytes[..self.width];
        element.iter().copied().cycle().take(len).collect()
    }
}

pub(crate) enum DeviceOp {
    Kernel {
        geometry: LaunchGeometry,
        body: KernelBody,
    },
    Copy {
        dst: Arc<dyn RawMemory>,
        src: Arc<dyn RawMemory>,
        bytes: usize,
    },
    Fill {
        dst: Arc<dyn RawMemory>,
        pattern: FillPattern,
        bytes: usize,
    },
}

impl DeviceOp {
    pub(crate) fn kind(&self) -> OpKind {
        match self {
            DeviceOp::Kernel { .. } => OpKind::Kernel,
            DeviceOp::Copy { .. } => OpKind::Copy,
            DeviceOp::Fill { .. } => OpKind::Fill,
        }
    }
}

impl fmt::Debug for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOp::Kernel { geometry, .. } => f
                .debug_struct("Kernel")
                .field("geometry", geometry)
                .finish_non_exhaustive(),
            DeviceOp::Copy { dst, src, bytes } => f
                .debug_struct("Copy")
                .field("dst", &dst.id())
                .field("src", &src.id())
                .field("bytes", bytes)
                .finish(),
            DeviceOp::Fill {
                dst,
                pattern,
                bytes,
            } => f
                .debug_struct("Fill")
                .field("dst", &dst.id())
                .field("pattern", pattern)
                .field("bytes", bytes)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OpNode {
    pub(crate) device: DeviceId,
    pub(crate) op: DeviceOp,
    pub(crate) successors: Vec<usize>,
    pub(crate) predecessors: Vec<usize>,
}

/// Structural identity of one node: everything but its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeSignature {
    kind: OpKind,
    device: DeviceId,
    geometry: Option<LaunchGeometry>,
    bytes: usize,
    successors: Vec<usize>,
}

impl OpNode {
    fn signature(&self) -> NodeSignature {
        let (geometry, bytes) = match &self.op {
            DeviceOp::Kernel { geometry, .. } => (Some(*geometry), 0),
            DeviceOp::Copy { bytes, .. } | DeviceOp::Fill { bytes, .. } => (None, *bytes),
        };
        NodeSignature {
            kind: self.op.kind(),
            device: self.device,
            geometry,
            bytes,
            successors: self.successors.clone(),
        }
    }
}

/// Node storage of one builder instance.
///
/// Handles share it so edges can be added through any of them; it is sealed
/// once the builder callable returns.
pub(crate) struct FlowGraph {
    id: u64,
    nodes: Mutex<Vec<OpNode>>,
    sealed: AtomicBool,
}

impl FlowGraph {
    pub(crate) fn new() -> Self {
        Self {
            id: FLOW_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            nodes: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn push(&self, device: DeviceId, op: DeviceOp) -> Result<usize> {
        self.ensure_open()?;
        let mut nodes = self.nodes.lock();
        nodes.push(OpNode {
            device,
            op,
            successors: Vec::new(),
            predecessors: Vec::new(),
        });
        Ok(nodes.len() - 1)
    }

    fn add_edge(&self, from: usize, to: usize) -> Result<()> {
        self.ensure_open()?;
        let mut nodes = self.nodes.lock();
        if nodes[from].successors.contains(&to) {
            return Ok(());
        }
        nodes[from].successors.push(to);
        nodes[to].predecessors.push(from);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::illegal_mutation(
                "device node edited after its builder was captured",
            ));
        }
        Ok(())
    }

    /// Seal the builder and take its nodes.
    pub(crate) fn seal(&self) -> Vec<OpNode> {
        self.sealed.store(true, Ordering::Release);
        std::mem::take(&mut *self.nodes.lock())
    }
}

impl fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGraph")
            .field("id", &self.id)
            .field("nodes", &self.len())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a node added through a [`DeviceFlow`](super::DeviceFlow).
#[derive(Clone)]
pub struct DeviceNode {
    graph: Arc<FlowGraph>,
    index: usize,
    kind: OpKind,
    device: DeviceId,
}

impl DeviceNode {
    pub(crate) fn new(graph: Arc<FlowGraph>, index: usize, kind: OpKind, device: DeviceId) -> Self {
        Self {
            graph,
            index,
            kind,
            device,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Make this node run before each of `others`.
    pub fn precede<'a, I>(&self, others: I) -> Result<&Self>
    where
        I: IntoIterator<Item = &'a DeviceNode>,
    {
        for other in others {
            self.check_same_builder(other)?;
            self.graph.add_edge(self.index, other.index)?;
        }
        Ok(self)
    }

    /// Make this node run after each of `others`.
    pub fn succeed<'a, I>(&self, others: I) -> Result<&Self>
    where
        I: IntoIterator<Item = &'a DeviceNode>,
    {
        for other in others {
            self.check_same_builder(other)?;
            self.graph.add_edge(other.index, self.index)?;
        }
        Ok(self)
    }

    fn check_same_builder(&self, other: &DeviceNode) -> Result<()> {
        if !Arc::ptr_eq(&self.graph, &other.graph) {
            return Err(Error::instantiation(format!(
                "edge between builder {} and builder {}",
                self.graph.id(),
                other.graph.id()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceNode")
            .field("builder", &self.graph.id())
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .finish()
    }
}

/// A sealed device sub-graph, ready to be instantiated by a backend.
#[derive(Debug)]
pub struct CapturedGraph {
    pub(crate) device: DeviceId,
    pub(crate) nodes: Vec<OpNode>,
}

/// Structural identity of a whole captured graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GraphSignature {
    device: DeviceId,
    nodes: Vec<NodeSignature>,
}

impl CapturedGraph {
    pub(crate) fn new(device: DeviceId, nodes: Vec<OpNode>) -> Self {
        Self { device, nodes }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.iter().map(|n| n.successors.len()).sum()
    }

    pub(crate) fn signature(&self) -> GraphSignature {
        GraphSignature {
            device: self.device,
            nodes: self.nodes.iter().map(OpNode::signature).collect(),
        }
    }

    /// Kahn order over the nodes; a cycle cannot be instantiated.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.predecessors.len()).collect();
        let mut ready: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &succ in &self.nodes[idx].successors {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push_back(succ);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::instantiation(format!(
                "device graph contains a cycle ({} of {} nodes unordered)",
                self.nodes.len() - order.len(),
                self.nodes.len()
            )));
        }

        Ok(order)
    }

    /// Move the parameters out, leaving the structure behind.
    pub(crate) fn into_ops(self) -> Vec<DeviceOp> {
        self.nodes.into_iter().map(|n| n.op).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_op() -> DeviceOp {
        DeviceOp::Kernel {
            geometry: LaunchGeometry::new(1, 1),
            body: Arc::new(|_| {}),
        }
    }

    fn node(graph: &Arc<FlowGraph>) -> DeviceNode {
        let index = graph.push(DeviceId(0), kernel_op()).unwrap();
        DeviceNode::new(graph.clone(), index, OpKind::Kernel, DeviceId(0))
    }

    #[test]
    fn test_fill_pattern_widths() {
        assert_eq!(FillPattern::new(&[1]).unwrap().width(), 1);
        assert_eq!(FillPattern::new(&[1, 2]).unwrap().expand(5), vec![1, 2, 1, 2, 1]);
        assert!(matches!(
            FillPattern::new(&[0; 8]),
            Err(Error::UnsupportedFillWidth { width: 8 })
        ));
        assert!(FillPattern::new(&[0; 3]).is_err());
    }

    #[test]
    fn test_edges_and_order() {
        let graph = Arc::new(FlowGraph::new());
        let a = node(&graph);
        let b = node(&graph);
        let c = node(&graph);

        c.succeed([&a, &b]).unwrap();
        b.precede([&c]).unwrap(); // duplicate edge ignored

        let captured = CapturedGraph::new(DeviceId(0), graph.seal());
        assert_eq!(captured.num_edges(), 2);
        let order = captured.topological_order().unwrap();
        assert_eq!(order.last(), Some(&2));
    }

    #[test]
    fn test_cycle_rejected() {
        let graph = Arc::new(FlowGraph::new());
        let a = node(&graph);
        let b = node(&graph);
        a.precede([&b]).unwrap();
        b.precede([&a]).unwrap();

        let captured = CapturedGraph::new(DeviceId(0), graph.seal());
        assert!(matches!(
            captured.topological_order(),
            Err(Error::GraphInstantiation(_))
        ));
    }

    #[test]
    fn test_cross_builder_edge_rejected() {
        let g1 = Arc::new(FlowGraph::new());
        let g2 = Arc::new(FlowGraph::new());
        let a = node(&g1);
        let b = node(&g2);
        assert!(matches!(a.precede([&b]), Err(Error::GraphInstantiation(_))));
    }

    #[test]
    fn test_sealed_graph_rejects_edges() {
        let graph = Arc::new(FlowGraph::new());
        let a = node(&graph);
        let b = node(&graph);
        graph.seal();
        assert!(matches!(a.precede([&b]), Err(Error::IllegalMutation(_))));
        assert!(graph.push(DeviceId(0), kernel_op()).is_err());
    }

    #[test]
    fn test_signature_ignores_parameters() {
        let build = |bytes: usize, value: u8| {
            let graph = Arc::new(FlowGraph::new());
            let mem: Arc<dyn RawMemory> = crate::device::Buffer::<u8>::host(16).memory();
            graph
                .push(
                    DeviceId(0),
                    DeviceOp::Fill {
                        dst: mem,
                        pattern: FillPattern::byte(value),
                        bytes,
                    },
                )
                .unwrap();
            CapturedGraph::new(DeviceId(0), graph.seal()).signature()
        };

        assert_eq!(build(4, 1), build(4, 9));
        assert_ne!(build(4, 1), build(8, 1));
    }
}
