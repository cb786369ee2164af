use super::panic_handler::PanicHandler;
use super::run::{RunHandle, RunState, RunTracker, StopPredicate};
use super::worker::{Shared, Worker};
use crate::config::Config;
use crate::device::{self, DeviceBackend, DeviceId};
use crate::error::{Error, Result};
use crate::graph::Taskflow;
use crate::scheduler::WorkStealingQueue;
use crate::telemetry::{Metrics, MetricsSnapshot};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Runs taskflows on a pool of host workers and a pool of device workers.
///
/// Host tasks only ever run on host workers and device tasks only on device
/// workers. Device worker `i` is bound to device `i % device_count`. Any
/// number of runs may be in flight at once; they share both pools.
///
/// ```
/// use heteroflow::prelude::*;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// # fn main() -> heteroflow::Result<()> {
/// let executor = Executor::new(Config::builder().host_workers(2).build()?)?;
/// let taskflow = Taskflow::new();
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let c = counter.clone();
/// let a = taskflow.emplace(move || { c.fetch_add(1, Ordering::SeqCst); })?;
/// let c = counter.clone();
/// let b = taskflow.emplace(move || { c.fetch_add(1, Ordering::SeqCst); })?;
/// a.precede([&b])?;
///
/// executor.run(&taskflow)?.wait()?;
/// assert_eq!(counter.load(Ordering::SeqCst), 2);
/// # Ok(())
/// # }
/// ```
pub struct Executor {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    num_host_workers: usize,
    num_device_workers: usize,
    next_run: AtomicU64,
}

impl Executor {
    /// Start an executor backed by the emulated device backend.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = device::default_backend(&config)?;
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: Config, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        config.validate()?;

        let device_count = backend.device_count();
        let num_host_workers = config.host_worker_threads();
        let num_device_workers = config.device_worker_threads(device_count);

        let (host, host_locals) = WorkStealingQueue::new(num_host_workers);
        let (device, device_locals) = WorkStealingQueue::new(num_device_workers);

        let shared = Arc::new(Shared {
            host,
            device,
            shutdown: AtomicBool::new(false),
            backend,
            metrics: Arc::new(Metrics::with_latency(config.enable_telemetry)),
            panic_handler: PanicHandler::new(config.panic_strategy),
            runs: RunTracker::default(),
        });

        let mut executor = Self {
            shared,
            threads: Vec::with_capacity(num_host_workers + num_device_workers),
            num_host_workers,
            num_device_workers,
            next_run: AtomicU64::new(0),
        };

        // a failed spawn drops `executor`, which joins what already started
        for (id, local) in host_locals.into_iter().enumerate() {
            let worker = Worker::host(id, local, executor.shared.clone());
            executor.spawn(&config, worker)?;
        }
        for (id, local) in device_locals.into_iter().enumerate() {
            let worker = Worker::device(id, DeviceId(id % device_count), local, executor.shared.clone());
            executor.spawn(&config, worker)?;
        }

        tracing::debug!(
            host_workers = num_host_workers,
            device_workers = num_device_workers,
            devices = device_count,
            backend = executor.shared.backend.name(),
            "executor started"
        );

        Ok(executor)
    }

    fn spawn(&mut self, config: &Config, worker: Worker) -> Result<()> {
        let name = format!("{}-{}-{}", config.thread_name_prefix, worker.kind(), worker.id());
        let mut builder = thread::Builder::new().name(name);

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || worker.run())
            .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Run every task of `taskflow` once.
    ///
    /// Structural problems (a cycle, device tasks without device support)
    /// are reported here, before anything is dispatched. Task failures are
    /// reported by [`RunHandle::wait`].
    pub fn run(&self, taskflow: &Taskflow) -> Result<RunHandle> {
        self.run_n(taskflow, 1)
    }

    /// Run the whole graph `n` times in sequence under one handle.
    pub fn run_n(&self, taskflow: &Taskflow, n: usize) -> Result<RunHandle> {
        let mut left = n;
        self.submit(
            taskflow,
            n == 0,
            Box::new(move || {
                left = left.saturating_sub(1);
                left == 0
            }),
        )
    }

    /// Run the whole graph repeatedly until `predicate` returns true.
    ///
    /// The predicate is checked after each complete pass, so the graph runs
    /// at least once.
    pub fn run_until<P>(&self, taskflow: &Taskflow, predicate: P) -> Result<RunHandle>
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.submit(taskflow, false, Box::new(predicate))
    }

    fn submit(&self, taskflow: &Taskflow, skip: bool, stop: StopPredicate) -> Result<RunHandle> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::executor("executor is shutting down"));
        }

        let (plan, guard) = taskflow.begin_run()?;

        let device_tasks = plan.num_device_tasks();
        if device_tasks > 0 {
            if self.device_count() == 0 {
                return Err(Error::NoDeviceSupport(format!(
                    "taskflow '{}' has {} device task(s) but the {} backend exposes no devices",
                    plan.graph_name,
                    device_tasks,
                    self.shared.backend.name()
                )));
            }
            if self.num_device_workers == 0 {
                return Err(Error::NoDeviceSupport(format!(
                    "taskflow '{}' has {} device task(s) but the executor has no device workers",
                    plan.graph_name, device_tasks
                )));
            }
        }

        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            run = id,
            taskflow = %plan.graph_name,
            taskflow_id = taskflow.id(),
            tasks = plan.len(),
            device_tasks,
            "run submitted"
        );

        let empty = plan.is_empty();
        let state = RunState::new(id, plan, guard, stop);
        self.shared.runs.begin();

        if skip || empty {
            state.finish(&self.shared);
        } else {
            state.start_pass(&self.shared);
        }

        Ok(RunHandle::new(state))
    }

    /// Block until every run submitted so far has finished.
    pub fn wait_for_all(&self) {
        self.shared.runs.wait_idle();
    }

    pub fn num_host_workers(&self) -> usize {
        self.num_host_workers
    }

    pub fn num_device_workers(&self) -> usize {
        self.num_device_workers
    }

    pub fn device_count(&self) -> usize {
        self.shared.backend.device_count()
    }

    /// Runs submitted but not yet finished.
    pub fn active_runs(&self) -> usize {
        self.shared.runs.active()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        self.shared.backend.clone()
    }

    fn shutdown(&mut self) {
        self.wait_for_all();
        self.shared.shutdown.store(true, Ordering::Release);

        // wake everyone up to check shutdown flag
        self.shared.host.notify_all();
        self.shared.device.notify_all();

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        tracing::debug!("executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("host_workers", &self.num_host_workers)
            .field("device_workers", &self.num_device_workers)
            .field("backend", &self.shared.backend)
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn executor(host: usize, devices: usize) -> Executor {
        let config = Config::builder()
            .host_workers(host)
            .devices(devices)
            .build()
            .unwrap();
        Executor::new(config).unwrap()
    }

    #[test]
    fn test_pool_sizes() {
        let executor = executor(3, 2);
        assert_eq!(executor.num_host_workers(), 3);
        assert_eq!(executor.num_device_workers(), 2);
        assert_eq!(executor.device_count(), 2);
        assert_eq!(executor.backend().name(), "emulator");
    }

    #[test]
    fn test_empty_taskflow_completes() {
        let executor = executor(1, 1);
        let handle = executor.run(&Taskflow::new()).unwrap();
        handle.wait().unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.passes(), 0);
    }

    #[test]
    fn test_run_n_zero() {
        let executor = executor(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let taskflow = Taskflow::new();
        let c = counter.clone();
        taskflow
            .emplace(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        executor.run_n(&taskflow, 0).unwrap().wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!taskflow.is_frozen());
    }

    #[test]
    fn test_run_until() {
        let executor = executor(2, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let taskflow = Taskflow::new();
        let c = counter.clone();
        taskflow
            .emplace(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let observed = counter.clone();
        let handle = executor
            .run_until(&taskflow, move || observed.load(Ordering::SeqCst) >= 5)
            .unwrap();
        handle.wait().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(handle.passes(), 5);
    }

    #[test]
    fn test_no_device_support() {
        let executor = executor(1, 0);
        assert_eq!(executor.num_device_workers(), 0);

        let taskflow = Taskflow::new();
        taskflow.emplace_device(|_| Ok(())).unwrap();
        assert!(matches!(
            executor.run(&taskflow),
            Err(Error::NoDeviceSupport(_))
        ));
        assert!(!taskflow.is_frozen());
    }

    #[test]
    fn test_wait_for_all() {
        let executor = executor(2, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let taskflow = Taskflow::new();
        let c = counter.clone();
        taskflow
            .emplace(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        for _ in 0..4 {
            executor.run(&taskflow).unwrap();
        }
        executor.wait_for_all();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(executor.active_runs(), 0);
        assert_eq!(executor.metrics().runs_completed, 4);
    }
}
