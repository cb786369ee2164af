// host and device worker threads
use super::panic_handler::PanicHandler;
use super::run::{RunState, RunTracker};
use crate::device::cache::DeviceGraphCache;
use crate::device::{DeviceBackend, DeviceFlow, DeviceId};
use crate::error::{Error, Result};
use crate::graph::{TaskKind, Work};
use crate::scheduler::WorkStealingQueue;
use crate::telemetry::Metrics;
use crate::util::Backoff;
use crossbeam_deque::Worker as WorkerQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// One ready task of one run.
pub(crate) struct Job {
    run: Arc<RunState>,
    task: usize,
}

impl Job {
    pub(crate) fn new(run: Arc<RunState>, task: usize) -> Self {
        Self { run, task }
    }

    fn kind(&self) -> TaskKind {
        self.run.plan().tasks[self.task].kind()
    }
}

/// State shared by every worker of one executor.
pub(crate) struct Shared {
    pub(crate) host: WorkStealingQueue<Job>,
    pub(crate) device: WorkStealingQueue<Job>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) backend: Arc<dyn DeviceBackend>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) panic_handler: PanicHandler,
    pub(crate) runs: RunTracker,
}

impl Shared {
    pub(crate) fn queue(&self, kind: TaskKind) -> &WorkStealingQueue<Job> {
        match kind {
            TaskKind::Host => &self.host,
            TaskKind::Device => &self.device,
        }
    }

    /// Push a ready job onto the injector of the pool that owns its kind.
    pub(crate) fn submit(&self, job: Job) {
        self.queue(job.kind()).push_global(job);
    }
}

// stats for each worker
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) tasks_stolen: AtomicU64,
}

pub(crate) struct Worker {
    id: usize,
    kind: TaskKind,
    device: Option<DeviceId>,
    local: WorkerQueue<Job>,
    state: WorkerState,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn host(id: usize, local: WorkerQueue<Job>, shared: Arc<Shared>) -> Self {
        Self::new(id, TaskKind::Host, None, local, shared)
    }

    pub(crate) fn device(id: usize, device: DeviceId, local: WorkerQueue<Job>, shared: Arc<Shared>) -> Self {
        Self::new(id, TaskKind::Device, Some(device), local, shared)
    }

    fn new(
        id: usize,
        kind: TaskKind,
        device: Option<DeviceId>,
        local: WorkerQueue<Job>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            kind,
            device,
            local,
            state: WorkerState::default(),
            shared,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    fn queue(&self) -> &WorkStealingQueue<Job> {
        self.shared.queue(self.kind)
    }

    // main loop
    pub(crate) fn run(self) {
        self.queue().register(self.id, thread::current());
        tracing::debug!(worker = self.id, kind = %self.kind, device = ?self.device, "worker started");

        let mut backoff = Backoff::new();

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            // local -> pool injector -> peers of the same pool
            if let Some(job) = self.find_job() {
                backoff.reset();
                self.execute(job);
            } else {
                backoff.snooze();
            }
        }

        tracing::debug!(
            worker = self.id,
            kind = %self.kind,
            executed = self.state.tasks_executed.load(Ordering::Relaxed),
            stolen = self.state.tasks_stolen.load(Ordering::Relaxed),
            "worker stopped"
        );
    }

    fn find_job(&self) -> Option<Job> {
        if let Some(job) = self.local.pop() {
            return Some(job);
        }

        if let Some(job) = self.queue().steal_global(&self.local) {
            return Some(job);
        }

        let job = self.queue().steal_from_peers(self.id, &self.local)?;
        self.state.tasks_stolen.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.record_task_stolen();
        tracing::trace!(worker = self.id, kind = %self.kind, "stole task");
        Some(job)
    }

    fn execute(&self, job: Job) {
        let run = job.run;
        let index = job.task;
        let task = &run.plan().tasks[index];
        let start = Instant::now();

        let outcome = match &task.work {
            Work::Host(f) => self.shared.panic_handler.execute(|| f()),
            Work::Device { build, cache } => self
                .shared
                .panic_handler
                .execute(|| self.run_device(&**build, cache)),
        };

        let duration_ns = start.elapsed().as_nanos() as u64;
        match task.kind() {
            TaskKind::Host => self.shared.metrics.record_host_task(duration_ns),
            TaskKind::Device => self.shared.metrics.record_device_task(duration_ns),
        }
        self.state.tasks_executed.fetch_add(1, Ordering::Relaxed);

        let result = match outcome {
            Ok(result) => result,
            Err(message) => {
                self.shared.metrics.record_task_panic();
                Err(Error::WorkerPanic {
                    task: task.name.clone(),
                    message,
                })
            }
        };

        if let Err(error) = result {
            tracing::warn!(
                run = run.id(),
                task = %task.name,
                worker = self.id,
                %error,
                "task failed"
            );
            self.shared.metrics.record_task_failed();
            run.fail(error);
        }

        self.complete(&run, index);
    }

    /// Build the device sub-graph, then instantiate or replay it.
    fn run_device(
        &self,
        build: &(dyn Fn(&mut DeviceFlow) -> Result<()> + Send + Sync),
        cache: &Mutex<DeviceGraphCache>,
    ) -> Result<()> {
        let assigned = self
            .device
            .ok_or_else(|| Error::executor("device task dispatched to a host worker"))?;
        let backend = &self.shared.backend;

        let mut cache = cache.lock();
        let device = cache.pinned_device(backend).unwrap_or(assigned);
        let mut flow = DeviceFlow::new(device, backend.device_count());
        build(&mut flow)?;

        let first = !cache.is_instantiated();
        let launches = cache.execute(backend, flow)?;
        self.shared.metrics.record_graph_launches(launches);
        tracing::trace!(worker = self.id, %device, launches, first, "device task replayed");
        Ok(())
    }

    /// Propagate completion of `index` to its successors.
    ///
    /// Once the run has halted, successors that become ready are skipped
    /// here instead of dispatched, which keeps the pass count exact.
    fn complete(&self, run: &Arc<RunState>, index: usize) {
        let mut finished = vec![index];

        while let Some(done) = finished.pop() {
            for &succ in &run.plan().tasks[done].successors {
                if !run.release(succ) {
                    continue;
                }
                if run.is_halted() {
                    self.shared.metrics.record_task_skipped();
                    tracing::trace!(run = run.id(), task = %run.plan().tasks[succ].name, "skipped");
                    finished.push(succ);
                } else {
                    self.schedule(Job::new(run.clone(), succ));
                }
            }

            if run.retire() {
                run.end_pass(&self.shared);
            }
        }
    }

    fn schedule(&self, job: Job) {
        if job.kind() == self.kind {
            self.local.push(job);
            self.queue().notify_one();
        } else {
            self.shared.submit(job);
        }
    }
}
