//! The native execution-graph layer a device task drives.

use super::node::CapturedGraph;
use super::DeviceId;
use crate::error::Result;
use std::fmt;

/// Opaque handle to an instantiated, replayable graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphHandle(pub(crate) u64);

impl fmt::Display for GraphHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

/// Accelerator runtime that instantiates and replays captured graphs.
///
/// Launches are asynchronous: `launch` enqueues on the device's stream and
/// returns; `synchronize` blocks until every launch of that graph has finished
/// and reports the first error those launches raised since the previous
/// synchronize. Failures of other graphs on the same stream are not reported.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Number of accelerators; zero means device graphs are unavailable.
    fn device_count(&self) -> usize;

    /// Build a replayable graph from captured nodes and edges.
    fn instantiate(&self, graph: CapturedGraph) -> Result<GraphHandle>;

    /// Swap node parameters of an instantiated graph in place.
    ///
    /// The caller guarantees `graph` has the topology the handle was
    /// instantiated with.
    fn update(&self, handle: GraphHandle, graph: CapturedGraph) -> Result<()>;

    fn launch(&self, handle: GraphHandle, device: DeviceId) -> Result<()>;

    fn synchronize(&self, handle: GraphHandle) -> Result<()>;

    fn destroy(&self, handle: GraphHandle);
}
