//! Per-run bookkeeping: join counters, the first error and completion.

use super::worker::{Job, Shared};
use crate::error::{Error, Result};
use crate::graph::{Plan, RunGuard};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decides after each complete pass whether the run is over.
pub(crate) type StopPredicate = Box<dyn FnMut() -> bool + Send>;

pub(crate) struct RunState {
    id: u64,
    plan: Plan,
    join_counters: Vec<AtomicUsize>,
    remaining: AtomicUsize,
    halted: AtomicBool,
    error: Mutex<Option<Error>>,
    stop: Mutex<StopPredicate>,
    passes: AtomicU64,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    guard: Mutex<Option<RunGuard>>,
    started: Instant,
}

impl RunState {
    pub(crate) fn new(id: u64, plan: Plan, guard: RunGuard, stop: StopPredicate) -> Arc<Self> {
        let join_counters = plan
            .tasks
            .iter()
            .map(|task| AtomicUsize::new(task.num_predecessors))
            .collect();

        Arc::new(Self {
            id,
            remaining: AtomicUsize::new(plan.len()),
            plan,
            join_counters,
            halted: AtomicBool::new(false),
            error: Mutex::new(None),
            stop: Mutex::new(stop),
            passes: AtomicU64::new(0),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            guard: Mutex::new(Some(guard)),
            started: Instant::now(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Count one finished predecessor of `index`. True when it became ready.
    pub(crate) fn release(&self, index: usize) -> bool {
        self.join_counters[index].fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Count one finished or skipped task. True when the pass is complete.
    pub(crate) fn retire(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Record a task failure. Only the first error is kept.
    pub(crate) fn fail(&self, error: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.halted.store(true, Ordering::Release);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Reset the join counters and dispatch the roots.
    pub(crate) fn start_pass(self: &Arc<Self>, shared: &Shared) {
        for (counter, task) in self.join_counters.iter().zip(&self.plan.tasks) {
            counter.store(task.num_predecessors, Ordering::Relaxed);
        }
        self.remaining.store(self.plan.len(), Ordering::Release);

        for &root in &self.plan.roots {
            shared.submit(Job::new(self.clone(), root));
        }
    }

    /// Called by whichever worker retired the last task of a pass.
    pub(crate) fn end_pass(self: &Arc<Self>, shared: &Shared) {
        let pass = self.passes.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(run = self.id, pass, "pass complete");

        if self.is_halted() {
            self.finish(shared);
            return;
        }

        let stop = {
            let mut predicate = self.stop.lock();
            shared.panic_handler.execute(|| (&mut **predicate)())
        };

        match stop {
            Ok(true) => self.finish(shared),
            Ok(false) => self.start_pass(shared),
            Err(message) => {
                self.fail(Error::WorkerPanic {
                    task: format!("stop predicate of run {}", self.id),
                    message,
                });
                self.finish(shared);
            }
        }
    }

    /// Release the taskflow and wake every waiter.
    pub(crate) fn finish(&self, shared: &Shared) {
        drop(self.guard.lock().take());

        let failed = self.error.lock().is_some();
        tracing::debug!(
            run = self.id,
            taskflow = %self.plan.graph_name,
            passes = self.passes.load(Ordering::Acquire),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            failed,
            "run finished"
        );
        shared.metrics.record_run_completed();

        *self.finished.lock() = true;
        self.finished_cv.notify_all();
        shared.runs.end();
    }

    fn result(&self) -> Result<()> {
        match self.error.lock().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Handle to a submitted run.
///
/// Dropping the handle does not cancel the run; use
/// [`Executor::wait_for_all`](super::Executor::wait_for_all) to wait for
/// runs whose handles were discarded.
#[derive(Clone)]
pub struct RunHandle {
    state: Arc<RunState>,
}

impl RunHandle {
    pub(crate) fn new(state: Arc<RunState>) -> Self {
        Self { state }
    }

    /// Block until the run finishes and return its first error, if any.
    pub fn wait(&self) -> Result<()> {
        let mut finished = self.state.finished.lock();
        while !*finished {
            self.state.finished_cv.wait(&mut finished);
        }
        drop(finished);
        self.state.result()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut finished = self.state.finished.lock();
        while !*finished {
            if self
                .state
                .finished_cv
                .wait_until(&mut finished, deadline)
                .timed_out()
            {
                break;
            }
        }
        let done = *finished;
        drop(finished);
        done.then(|| self.state.result())
    }

    pub fn is_finished(&self) -> bool {
        *self.state.finished.lock()
    }

    /// Complete passes over the graph so far.
    pub fn passes(&self) -> u64 {
        self.state.passes.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.state.id)
            .field("taskflow", &self.state.plan.graph_name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Counts runs that have been submitted but not finished.
#[derive(Debug, Default)]
pub(crate) struct RunTracker {
    active: Mutex<usize>,
    idle: Condvar,
}

impl RunTracker {
    pub(crate) fn begin(&self) {
        *self.active.lock() += 1;
    }

    pub(crate) fn end(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.lock()
    }

    pub(crate) fn wait_idle(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.idle.wait(&mut active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_tracker_waits_for_end() {
        let tracker = Arc::new(RunTracker::default());
        tracker.begin();
        tracker.begin();
        assert_eq!(tracker.active(), 2);

        let ender = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                tracker.end();
                tracker.end();
            })
        };

        tracker.wait_idle();
        assert_eq!(tracker.active(), 0);
        ender.join().unwrap();
    }

    #[test]
    fn test_tracker_idle_returns_immediately() {
        RunTracker::default().wait_idle();
    }
}
