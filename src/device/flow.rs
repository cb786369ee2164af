//! The device sub-graph builder handed to device task callables.

use super::buffer::{Buffer, RawMemory};
use super::geometry::{KernelContext, LaunchGeometry};
use super::node::{CapturedGraph, DeviceNode, DeviceOp, FillPattern, FlowGraph, OpKind};
use super::DeviceId;
use crate::error::{Error, Result};
use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;

/// How many times an instantiated graph is replayed in one task execution.
pub(crate) enum Iteration {
    Repeat(usize),
    Until(Box<dyn FnMut() -> bool + Send>),
}

/// Builder for one device sub-graph.
///
/// Nodes are only recorded here; nothing touches a device until the callable
/// returns and the executor instantiates (or replays) the captured graph.
///
/// ```no_run
/// use heteroflow::prelude::*;
///
/// # fn main() -> heteroflow::Result<()> {
/// let x = Buffer::host_from(&[1.0f32; 256]);
/// let dx = Buffer::<f32>::on_device(DeviceId(0), 256);
///
/// let taskflow = Taskflow::new();
/// taskflow.emplace_device(move |flow| {
///     let h2d = flow.copy(&dx, &x, 256)?;
///     let dx2 = dx.clone();
///     let scale = flow.kernel(LaunchGeometry::for_elements(256, 128), move |ctx| {
///         let i = ctx.global_x();
///         if i < 256 {
///             dx2.set(i, dx2.get(i) * 2.0);
///         }
///     })?;
///     scale.succeed([&h2d])?;
///     Ok(())
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceFlow {
    graph: Arc<FlowGraph>,
    device: DeviceId,
    device_count: usize,
    repeat: Option<usize>,
    predicate: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl DeviceFlow {
    pub(crate) fn new(device: DeviceId, device_count: usize) -> Self {
        Self {
            graph: Arc::new(FlowGraph::new()),
            device,
            device_count,
            repeat: None,
            predicate: None,
        }
    }

    /// Set the default device for nodes added after this call.
    pub fn device(&mut self, id: i64) -> Result<&mut Self> {
        self.device = DeviceId::resolve(id, self.device_count)?;
        Ok(self)
    }

    pub fn current_device(&self) -> DeviceId {
        self.device
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_nodes() == 0
    }

    /// Launch `body` once per logical thread of `geometry`.
    ///
    /// Kernel arguments are whatever the closure captures.
    pub fn kernel<F>(&mut self, geometry: LaunchGeometry, body: F) -> Result<DeviceNode>
    where
        F: Fn(&KernelContext) + Send + Sync + 'static,
    {
        let device = self.device;
        self.push_kernel(device, geometry, body)
    }

    /// Like [`kernel`](Self::kernel) but bound to device `id` for this node only.
    ///
    /// The node still executes as part of its graph's launch, on the stream of
    /// the device the graph was launched on, in dependency order with the rest
    /// of the graph. `id` is validated, becomes part of the graph's signature
    /// and is what the body sees as [`KernelContext::device`].
    pub fn kernel_on<F>(&mut self, id: i64, geometry: LaunchGeometry, body: F) -> Result<DeviceNode>
    where
        F: Fn(&KernelContext) + Send + Sync + 'static,
    {
        let device = DeviceId::resolve(id, self.device_count)?;
        self.push_kernel(device, geometry, body)
    }

    fn push_kernel<F>(&mut self, device: DeviceId, geometry: LaunchGeometry, body: F) -> Result<DeviceNode>
    where
        F: Fn(&KernelContext) + Send + Sync + 'static,
    {
        self.push(
            device,
            DeviceOp::Kernel {
                geometry,
                body: Arc::new(body),
            },
        )
    }

    /// Copy `count` elements from `src` to `dst`.
    pub fn copy<T>(&mut self, dst: &Buffer<T>, src: &Buffer<T>, count: usize) -> Result<DeviceNode>
    where
        T: Pod + Send + Sync,
    {
        let bytes = element_bytes::<T>(count)?;
        self.memcpy(dst, src, bytes)
    }

    /// Copy `bytes` raw bytes from `src` to `dst`.
    pub fn memcpy<D, S>(&mut self, dst: &Buffer<D>, src: &Buffer<S>, bytes: usize) -> Result<DeviceNode>
    where
        D: Pod + Send + Sync,
        S: Pod + Send + Sync,
    {
        let dst = dst.memory();
        let src = src.memory();
        check_range("copy destination", &*dst, bytes)?;
        check_range("copy source", &*src, bytes)?;

        tracing::trace!(
            from = %src.placement(),
            to = %dst.placement(),
            bytes,
            "captured copy"
        );

        let device = self.device;
        self.push(device, DeviceOp::Copy { dst, src, bytes })
    }

    /// Write `value` into the first `count` elements of `dst`.
    ///
    /// The element type must be 1, 2 or 4 bytes wide.
    pub fn fill<T>(&mut self, dst: &Buffer<T>, value: T, count: usize) -> Result<DeviceNode>
    where
        T: Pod + Send + Sync,
    {
        let pattern = FillPattern::new(bytemuck::bytes_of(&value))?;
        let bytes = element_bytes::<T>(count)?;
        self.push_fill(dst.memory(), pattern, bytes)
    }

    /// Same as `fill(dst, 0, count)`.
    pub fn zero<T>(&mut self, dst: &Buffer<T>, count: usize) -> Result<DeviceNode>
    where
        T: Pod + Send + Sync,
    {
        self.fill(dst, T::zeroed(), count)
    }

    /// Set the first `bytes` bytes of `dst` to `value`.
    pub fn memset<T>(&mut self, dst: &Buffer<T>, value: u8, bytes: usize) -> Result<DeviceNode>
    where
        T: Pod + Send + Sync,
    {
        self.push_fill(dst.memory(), FillPattern::byte(value), bytes)
    }

    fn push_fill(&mut self, dst: Arc<dyn RawMemory>, pattern: FillPattern, bytes: usize) -> Result<DeviceNode> {
        check_range("fill destination", &*dst, bytes)?;
        let device = self.device;
        self.push(
            device,
            DeviceOp::Fill {
                dst,
                pattern,
                bytes,
            },
        )
    }

    fn push(&mut self, device: DeviceId, op: DeviceOp) -> Result<DeviceNode> {
        let kind: OpKind = op.kind();
        let index = self.graph.push(device, op)?;
        Ok(DeviceNode::new(self.graph.clone(), index, kind, device))
    }

    /// Replay the instantiated graph `n` times per task execution.
    pub fn repeat(&mut self, n: usize) -> &mut Self {
        self.repeat = Some(n);
        self
    }

    /// Replay the instantiated graph until `predicate` returns true.
    ///
    /// The predicate is checked after each completed replay, so the graph
    /// runs at least once. Overrides [`repeat`](Self::repeat) when both are set.
    pub fn predicate<P>(&mut self, predicate: P) -> &mut Self
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Seal the builder: outstanding node handles can no longer add edges.
    pub(crate) fn capture(self) -> (CapturedGraph, Iteration) {
        let nodes = self.graph.seal();
        let iteration = match (self.predicate, self.repeat) {
            (Some(predicate), _) => Iteration::Until(predicate),
            (None, Some(n)) => Iteration::Repeat(n),
            (None, None) => Iteration::Repeat(1),
        };
        (CapturedGraph::new(self.device, nodes), iteration)
    }
}

impl fmt::Debug for DeviceFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFlow")
            .field("graph", &self.graph)
            .field("device", &self.device)
            .field("device_count", &self.device_count)
            .field("repeat", &self.repeat)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

fn element_bytes<T>(count: usize) -> Result<usize> {
    count.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
        Error::invalid_argument(format!("{} elements overflow the address space", count))
    })
}

fn check_range(what: &str, memory: &dyn RawMemory, bytes: usize) -> Result<()> {
    if bytes > memory.byte_len() {
        return Err(Error::invalid_argument(format!(
            "{} holds {} bytes, operation needs {}",
            what,
            memory.byte_len(),
            bytes
        )));
    }
    Ok(())
}
