//! Instantiate-once memoization of a device task's graph.

use super::backend::{DeviceBackend, GraphHandle};
use super::flow::{DeviceFlow, Iteration};
use super::node::GraphSignature;
use super::DeviceId;
use crate::error::{Error, Result};
use std::sync::Arc;

struct CachedGraph {
    handle: GraphHandle,
    device: DeviceId,
    signature: GraphSignature,
    backend: Arc<dyn DeviceBackend>,
}

/// Per-task cache of the instantiated graph.
///
/// The first execution instantiates; later executions must capture the same
/// topology and only have their parameters swapped in.
#[derive(Default)]
pub(crate) struct DeviceGraphCache {
    entry: Option<CachedGraph>,
}

impl DeviceGraphCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Device a previous instantiation on `backend` pinned this task to.
    pub(crate) fn pinned_device(&self, backend: &Arc<dyn DeviceBackend>) -> Option<DeviceId> {
        self.entry
            .as_ref()
            .filter(|cached| same_backend(&cached.backend, backend))
            .map(|cached| cached.device)
    }

    pub(crate) fn is_instantiated(&self) -> bool {
        self.entry.is_some()
    }

    /// Instantiate or update the graph captured by `flow`, then replay it per
    /// its iteration control. Returns the number of launches.
    pub(crate) fn execute(&mut self, backend: &Arc<dyn DeviceBackend>, flow: DeviceFlow) -> Result<u64> {
        let (captured, iteration) = flow.capture();
        let signature = captured.signature();
        let device = captured.device();

        let stale = self
            .entry
            .as_ref()
            .is_some_and(|cached| !same_backend(&cached.backend, backend));
        if stale {
            self.clear();
        }

        let handle = match &self.entry {
            Some(cached) => {
                if cached.signature != signature {
                    return Err(Error::illegal_mutation(format!(
                        "device graph {} changed structure after instantiation",
                        cached.handle
                    )));
                }
                if captured.is_empty() {
                    return Ok(0);
                }
                backend.update(cached.handle, captured)?;
                cached.handle
            }
            None => {
                if captured.is_empty() {
                    return Ok(0);
                }
                let handle = backend.instantiate(captured)?;
                self.entry = Some(CachedGraph {
                    handle,
                    device,
                    signature,
                    backend: backend.clone(),
                });
                handle
            }
        };

        replay(backend.as_ref(), handle, device, iteration)
    }

    fn clear(&mut self) {
        if let Some(cached) = self.entry.take() {
            cached.backend.destroy(cached.handle);
        }
    }
}

impl Drop for DeviceGraphCache {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for DeviceGraphCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGraphCache")
            .field("handle", &self.entry.as_ref().map(|c| c.handle))
            .field("device", &self.entry.as_ref().map(|c| c.device))
            .finish()
    }
}

fn same_backend(a: &Arc<dyn DeviceBackend>, b: &Arc<dyn DeviceBackend>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Launch a cached graph the number of times `iteration` asks for.
///
/// A fixed count is launched back to back and synchronized once; a predicate
/// must observe finished work, so each replay is synchronized before it runs.
fn replay(
    backend: &dyn DeviceBackend,
    handle: GraphHandle,
    device: DeviceId,
    iteration: Iteration,
) -> Result<u64> {
    let mut launches = 0u64;

    match iteration {
        Iteration::Repeat(n) => {
            for _ in 0..n.max(1) {
                if let Err(err) = backend.launch(handle, device) {
                    let _ = backend.synchronize(handle);
                    return Err(err);
                }
                launches += 1;
            }
            backend.synchronize(handle)?;
        }
        Iteration::Until(mut predicate) => loop {
            backend.launch(handle, device)?;
            launches += 1;
            backend.synchronize(handle)?;
            if predicate() {
                break;
            }
        },
    }

    Ok(launches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Buffer, Emulator, LaunchGeometry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> (Arc<Emulator>, Arc<dyn DeviceBackend>) {
        let emulator = Arc::new(Emulator::new(2, 64).unwrap());
        let backend: Arc<dyn DeviceBackend> = emulator.clone();
        (emulator, backend)
    }

    fn counting_flow(counter: &Arc<AtomicUsize>) -> DeviceFlow {
        let mut flow = DeviceFlow::new(DeviceId(0), 2);
        let counter = counter.clone();
        flow.kernel(LaunchGeometry::new(1, 1), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        flow
    }

    #[test]
    fn test_instantiates_once() {
        let (emulator, backend) = backend();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cache = DeviceGraphCache::new();

        for _ in 0..3 {
            let launches = cache.execute(&backend, counting_flow(&counter)).unwrap();
            assert_eq!(launches, 1);
        }

        assert_eq!(emulator.instantiations(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(cache.is_instantiated());
        assert_eq!(cache.pinned_device(&backend), Some(DeviceId(0)));
    }

    #[test]
    fn test_repeat_and_predicate() {
        let (_, backend) = backend();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cache = DeviceGraphCache::new();

        let mut flow = counting_flow(&counter);
        flow.repeat(4);
        assert_eq!(cache.execute(&backend, flow).unwrap(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        let observed = counter.clone();
        let mut flow = counting_flow(&counter);
        flow.predicate(move || observed.load(Ordering::SeqCst) >= 7);
        assert_eq!(cache.execute(&backend, flow).unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_repeat_zero_runs_once() {
        let (_, backend) = backend();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut flow = counting_flow(&counter);
        flow.repeat(0);

        assert_eq!(DeviceGraphCache::new().execute(&backend, flow).unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_structure_change_rejected() {
        let (emulator, backend) = backend();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cache = DeviceGraphCache::new();
        cache.execute(&backend, counting_flow(&counter)).unwrap();

        let mut flow = counting_flow(&counter);
        flow.memset(&Buffer::<u8>::host(4), 0, 4).unwrap();
        assert!(matches!(
            cache.execute(&backend, flow),
            Err(Error::IllegalMutation(_))
        ));
        assert_eq!(emulator.instantiations(), 1);
    }

    #[test]
    fn test_drop_destroys_graph() {
        let (emulator, backend) = backend();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut cache = DeviceGraphCache::new();
            cache.execute(&backend, counting_flow(&counter)).unwrap();
            assert_eq!(emulator.live_graphs(), 1);
        }
        assert_eq!(emulator.live_graphs(), 0);
    }

    #[test]
    fn test_empty_flow_launches_nothing() {
        let (emulator, backend) = backend();
        let flow = DeviceFlow::new(DeviceId(0), 2);
        assert_eq!(DeviceGraphCache::new().execute(&backend, flow).unwrap(), 0);
        assert_eq!(emulator.instantiations(), 0);
    }
}
