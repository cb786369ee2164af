//! Host-resident accelerator model.
//!
//! Each emulated device owns a stream thread that executes launched graphs in
//! FIFO order. Kernels run their body once per logical thread of the launch
//! geometry; copies and fills move bytes between [`Buffer`](super::Buffer)s.
//!
//! Completion is tracked per instantiated graph, not per stream: two graphs
//! sharing a stream never see each other's failures.

use super::backend::{DeviceBackend, GraphHandle};
use super::geometry::{Dim3, KernelContext, LaunchGeometry};
use super::node::{CapturedGraph, DeviceOp};
use super::DeviceId;
use crate::error::{Error, Result};
use crate::executor::panic_handler::payload_message;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const MAX_THREADS_PER_BLOCK: u64 = 1024;

/// An instantiated graph: fixed execution order plus swappable parameters.
struct ExecGraph {
    handle: GraphHandle,
    device: DeviceId,
    order: Vec<usize>,
    node_devices: Vec<DeviceId>,
    ops: Mutex<Arc<Vec<DeviceOp>>>,
    completion: Completion,
}

/// Launches of one graph still in flight, plus the first failure among them.
#[derive(Default)]
struct Completion {
    outstanding: Mutex<usize>,
    idle: Condvar,
    error: Mutex<Option<Error>>,
}

impl Completion {
    fn begin(&self) {
        *self.outstanding.lock() += 1;
    }

    fn end(&self, result: Result<()>) {
        if let Err(err) = result {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }

        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
        drop(outstanding);

        match self.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Launch {
    graph: Arc<ExecGraph>,
    ops: Arc<Vec<DeviceOp>>,
}

struct DeviceStream {
    sender: Option<Sender<Launch>>,
    thread: Option<JoinHandle<()>>,
}

pub struct Emulator {
    streams: Vec<DeviceStream>,
    graphs: Mutex<HashMap<GraphHandle, Arc<ExecGraph>>>,
    next_handle: AtomicU64,
    max_graph_nodes: usize,
    instantiations: AtomicU64,
    launches: AtomicU64,
}

impl Emulator {
    pub fn new(device_count: usize, max_graph_nodes: usize) -> Result<Self> {
        let mut streams = Vec::with_capacity(device_count);

        for idx in 0..device_count {
            let device = DeviceId(idx);
            let (sender, receiver) = unbounded();

            let thread = thread::Builder::new()
                .name(format!("heteroflow-stream-{}", idx))
                .spawn(move || stream_loop(device, receiver))
                .map_err(|e| Error::executor(format!("stream spawn failed: {}", e)))?;

            streams.push(DeviceStream {
                sender: Some(sender),
                thread: Some(thread),
            });
        }

        tracing::debug!(devices = device_count, "emulated devices ready");

        Ok(Self {
            streams,
            graphs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            max_graph_nodes,
            instantiations: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        })
    }

    /// Number of graphs instantiated since creation.
    pub fn instantiations(&self) -> u64 {
        self.instantiations.load(Ordering::Relaxed)
    }

    /// Number of graph launches since creation.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Graphs currently instantiated and not yet destroyed.
    pub fn live_graphs(&self) -> usize {
        self.graphs.lock().len()
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.0 >= self.streams.len() {
            return Err(Error::InvalidDevice {
                id: device.0 as i64,
                count: self.streams.len(),
            });
        }
        Ok(())
    }

    fn lookup(&self, handle: GraphHandle) -> Option<Arc<ExecGraph>> {
        self.graphs.lock().get(&handle).cloned()
    }

    fn validate(&self, graph: &CapturedGraph) -> Result<Vec<usize>> {
        if graph.len() > self.max_graph_nodes {
            return Err(Error::instantiation(format!(
                "{} nodes exceed the limit of {}",
                graph.len(),
                self.max_graph_nodes
            )));
        }

        if graph.device.0 >= self.streams.len() {
            return Err(Error::instantiation(format!(
                "graph bound to missing {}",
                graph.device
            )));
        }

        for (idx, node) in graph.nodes.iter().enumerate() {
            if node.device.0 >= self.streams.len() {
                return Err(Error::instantiation(format!(
                    "node {} bound to missing {}",
                    idx, node.device
                )));
            }
            if let DeviceOp::Kernel { geometry, .. } = &node.op {
                check_geometry(idx, geometry)?;
            }
        }

        graph.topological_order()
    }
}

fn check_geometry(idx: usize, geometry: &LaunchGeometry) -> Result<()> {
    if geometry.grid.is_empty() || geometry.block.is_empty() {
        return Err(Error::instantiation(format!(
            "kernel node {} has an empty launch ({})",
            idx, geometry
        )));
    }
    if geometry.block.volume() > MAX_THREADS_PER_BLOCK {
        return Err(Error::instantiation(format!(
            "kernel node {} requests {} threads per block (max {})",
            idx,
            geometry.block.volume(),
            MAX_THREADS_PER_BLOCK
        )));
    }
    Ok(())
}

impl DeviceBackend for Emulator {
    fn name(&self) -> &str {
        "emulator"
    }

    fn device_count(&self) -> usize {
        self.streams.len()
    }

    fn instantiate(&self, graph: CapturedGraph) -> Result<GraphHandle> {
        let order = self.validate(&graph)?;
        let handle = GraphHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let device = graph.device;
        let node_devices = graph.nodes.iter().map(|n| n.device).collect();

        tracing::debug!(%handle, %device, nodes = graph.len(), edges = graph.num_edges(), "instantiated device graph");

        let exec = Arc::new(ExecGraph {
            handle,
            device,
            order,
            node_devices,
            ops: Mutex::new(Arc::new(graph.into_ops())),
            completion: Completion::default(),
        });

        self.graphs.lock().insert(handle, exec);
        self.instantiations.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn update(&self, handle: GraphHandle, graph: CapturedGraph) -> Result<()> {
        let exec = self
            .lookup(handle)
            .ok_or_else(|| Error::instantiation(format!("unknown {}", handle)))?;

        if graph.len() != exec.order.len() {
            return Err(Error::illegal_mutation(format!(
                "{} has {} nodes, update supplies {}",
                handle,
                exec.order.len(),
                graph.len()
            )));
        }

        *exec.ops.lock() = Arc::new(graph.into_ops());
        tracing::trace!(%handle, "updated device graph parameters");
        Ok(())
    }

    fn launch(&self, handle: GraphHandle, device: DeviceId) -> Result<()> {
        self.check_device(device)?;
        let graph = self
            .lookup(handle)
            .ok_or_else(|| Error::device(device, format!("launch of unknown {}", handle)))?;
        let ops = graph.ops.lock().clone();

        let sender = self.streams[device.0]
            .sender
            .as_ref()
            .ok_or_else(|| Error::device(device, "stream closed"))?;

        graph.completion.begin();
        if let Err(failed) = sender.send(Launch { graph, ops }) {
            failed.0.graph.completion.end(Ok(()));
            return Err(Error::device(device, "stream thread exited"));
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%handle, %device, "launched device graph");
        Ok(())
    }

    fn synchronize(&self, handle: GraphHandle) -> Result<()> {
        let graph = self
            .lookup(handle)
            .ok_or_else(|| Error::invalid_argument(format!("synchronize on unknown {}", handle)))?;
        graph.completion.wait()
    }

    fn destroy(&self, handle: GraphHandle) {
        if self.graphs.lock().remove(&handle).is_some() {
            tracing::trace!(%handle, "destroyed device graph");
        }
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("devices", &self.streams.len())
            .field("max_graph_nodes", &self.max_graph_nodes)
            .field("live_graphs", &self.graphs.lock().len())
            .field("instantiations", &self.instantiations())
            .field("launches", &self.launches())
            .finish()
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        // closing the channel ends the stream loop once queued work drains
        for stream in &mut self.streams {
            stream.sender.take();
        }
        for stream in &mut self.streams {
            if let Some(thread) = stream.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn stream_loop(device: DeviceId, receiver: Receiver<Launch>) {
    while let Ok(launch) = receiver.recv() {
        let result = catch_unwind(AssertUnwindSafe(|| execute_graph(&launch)))
            .unwrap_or_else(|payload| {
                Err(Error::device(
                    device,
                    format!("kernel panicked: {}", payload_message(&*payload)),
                ))
            });

        if let Err(err) = &result {
            tracing::warn!(
                stream = %device,
                graph_device = %launch.graph.device,
                handle = %launch.graph.handle,
                error = %err,
                "device graph failed"
            );
        }

        launch.graph.completion.end(result);
    }
}

fn execute_graph(launch: &Launch) -> Result<()> {
    let graph = &launch.graph;
    for &idx in &graph.order {
        let device = graph.node_devices[idx];
        match &launch.ops[idx] {
            DeviceOp::Kernel { geometry, body } => run_kernel(device, geometry, body.as_ref()),
            DeviceOp::Copy { dst, src, bytes } => {
                if *bytes > dst.byte_len() || *bytes > src.byte_len() {
                    return Err(Error::device(
                        device,
                        format!("copy of {} bytes out of bounds", bytes),
                    ));
                }
                let data = src.read_bytes(*bytes);
                dst.write_bytes(&data);
            }
            DeviceOp::Fill {
                dst,
                pattern,
                bytes,
            } => {
                if *bytes > dst.byte_len() {
                    return Err(Error::device(
                        device,
                        format!("fill of {} bytes out of bounds", bytes),
                    ));
                }
                dst.write_bytes(&pattern.expand(*bytes));
            }
        }
    }
    Ok(())
}

fn run_kernel(device: DeviceId, geometry: &LaunchGeometry, body: &(dyn Fn(&KernelContext) + Send + Sync)) {
    let grid = geometry.grid;
    let block = geometry.block;

    for bz in 0..grid.z {
        for by in 0..grid.y {
            for bx in 0..grid.x {
                for tz in 0..block.z {
                    for ty in 0..block.y {
                        for tx in 0..block.x {
                            body(&KernelContext {
                                device,
                                grid_dim: grid,
                                block_dim: block,
                                block_idx: Dim3::new(bx, by, bz),
                                thread_idx: Dim3::new(tx, ty, tz),
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::buffer::Buffer;
    use crate::device::node::{FillPattern, FlowGraph};

    fn capture(device: DeviceId, build: impl FnOnce(&FlowGraph)) -> CapturedGraph {
        let graph = FlowGraph::new();
        build(&graph);
        CapturedGraph::new(device, graph.seal())
    }

    #[test]
    fn test_launch_and_synchronize() {
        let emulator = Emulator::new(2, 16).unwrap();
        let dst = Buffer::<u32>::host(8);
        let mem = dst.memory();

        let graph = capture(DeviceId(1), |g| {
            g.push(
                DeviceId(1),
                DeviceOp::Fill {
                    dst: mem,
                    pattern: FillPattern::new(&7u32.to_ne_bytes()).unwrap(),
                    bytes: 32,
                },
            )
            .unwrap();
        });

        let handle = emulator.instantiate(graph).unwrap();
        emulator.launch(handle, DeviceId(1)).unwrap();
        emulator.synchronize(handle).unwrap();

        assert_eq!(dst.to_vec(), vec![7; 8]);
        assert_eq!(emulator.instantiations(), 1);
        assert_eq!(emulator.launches(), 1);
    }

    #[test]
    fn test_kernel_covers_geometry() {
        let emulator = Emulator::new(1, 16).unwrap();
        let out = Buffer::<u32>::host(64);
        let target = out.clone();

        let graph = capture(DeviceId(0), |g| {
            g.push(
                DeviceId(0),
                DeviceOp::Kernel {
                    geometry: LaunchGeometry::new(4, 16),
                    body: Arc::new(move |ctx| {
                        let i = ctx.global_x();
                        target.set(i, i as u32 * 2);
                    }),
                },
            )
            .unwrap();
        });

        let handle = emulator.instantiate(graph).unwrap();
        emulator.launch(handle, DeviceId(0)).unwrap();
        emulator.synchronize(handle).unwrap();

        let expected: Vec<u32> = (0..64).map(|i| i * 2).collect();
        assert_eq!(out.to_vec(), expected);
    }

    #[test]
    fn test_rejects_oversized_block() {
        let emulator = Emulator::new(1, 16).unwrap();
        let graph = capture(DeviceId(0), |g| {
            g.push(
                DeviceId(0),
                DeviceOp::Kernel {
                    geometry: LaunchGeometry::new(1, (64, 32)),
                    body: Arc::new(|_| {}),
                },
            )
            .unwrap();
        });

        assert!(matches!(
            emulator.instantiate(graph),
            Err(Error::GraphInstantiation(_))
        ));
    }

    #[test]
    fn test_rejects_node_limit() {
        let emulator = Emulator::new(1, 2).unwrap();
        let graph = capture(DeviceId(0), |g| {
            for _ in 0..3 {
                g.push(
                    DeviceId(0),
                    DeviceOp::Kernel {
                        geometry: LaunchGeometry::new(1, 1),
                        body: Arc::new(|_| {}),
                    },
                )
                .unwrap();
            }
        });

        assert!(emulator.instantiate(graph).is_err());
        assert_eq!(emulator.instantiations(), 0);
    }

    #[test]
    fn test_kernel_panic_is_sticky_until_synchronize() {
        let emulator = Emulator::new(1, 16).unwrap();
        let graph = capture(DeviceId(0), |g| {
            g.push(
                DeviceId(0),
                DeviceOp::Kernel {
                    geometry: LaunchGeometry::new(1, 1),
                    body: Arc::new(|_| panic!("bad kernel")),
                },
            )
            .unwrap();
        });

        let handle = emulator.instantiate(graph).unwrap();
        emulator.launch(handle, DeviceId(0)).unwrap();
        let err = emulator.synchronize(handle).unwrap_err();
        assert!(err.to_string().contains("bad kernel"));

        // the error is consumed by the synchronize that reported it
        emulator.synchronize(handle).unwrap();
    }

    #[test]
    fn test_failures_stay_with_their_graph() {
        let emulator = Emulator::new(1, 16).unwrap();
        let kernel = |body: Arc<dyn Fn(&KernelContext) + Send + Sync>| {
            capture(DeviceId(0), move |g| {
                g.push(
                    DeviceId(0),
                    DeviceOp::Kernel {
                        geometry: LaunchGeometry::new(1, 1),
                        body,
                    },
                )
                .unwrap();
            })
        };

        let bad = emulator
            .instantiate(kernel(Arc::new(|_: &KernelContext| panic!("bad kernel"))))
            .unwrap();
        let good = emulator
            .instantiate(kernel(Arc::new(|_: &KernelContext| {
                thread::sleep(std::time::Duration::from_millis(2));
            })))
            .unwrap();

        // both graphs share the only stream; the failure must not leak across
        for _ in 0..20 {
            emulator.launch(bad, DeviceId(0)).unwrap();
            emulator.launch(good, DeviceId(0)).unwrap();
            emulator.synchronize(good).unwrap();
            assert!(emulator.synchronize(bad).is_err());
        }
    }

    #[test]
    fn test_destroy_and_bad_device() {
        let emulator = Emulator::new(1, 16).unwrap();
        let handle = emulator
            .instantiate(capture(DeviceId(0), |_| {}))
            .unwrap();
        assert_eq!(emulator.live_graphs(), 1);

        assert!(emulator.launch(handle, DeviceId(3)).is_err());
        emulator.destroy(handle);
        assert_eq!(emulator.live_graphs(), 0);
        assert!(emulator.launch(handle, DeviceId(0)).is_err());
        assert!(emulator.synchronize(handle).is_err());
    }
}
