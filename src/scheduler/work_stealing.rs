use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::Thread;

/// Shared side of one worker pool: a global injector, a stealer per worker
/// and the worker threads to unpark when work arrives.
pub struct WorkStealingQueue<T> {
    injector: Injector<T>,
    stealers: Vec<Stealer<T>>,
    sleepers: RwLock<Vec<Option<Thread>>>,
    next_wake: AtomicUsize,
}

impl<T> WorkStealingQueue<T> {
    /// Create the shared queue and the local queues owned by each worker.
    pub fn new(num_workers: usize) -> (Self, Vec<Worker<T>>) {
        let mut workers = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let worker = Worker::new_fifo();
            stealers.push(worker.stealer());
            workers.push(worker);
        }

        let queue = Self {
            injector: Injector::new(),
            stealers,
            sleepers: RwLock::new(vec![None; num_workers]),
            next_wake: AtomicUsize::new(0),
        };
        (queue, workers)
    }

    pub fn num_workers(&self) -> usize {
        self.stealers.len()
    }

    /// Record the thread running worker `id` so it can be woken.
    pub fn register(&self, id: usize, thread: Thread) {
        if let Some(slot) = self.sleepers.write().get_mut(id) {
            *slot = Some(thread);
        }
    }

    pub fn push_global(&self, item: T) {
        self.injector.push(item);
        self.notify_one();
    }

    /// Wake one worker, rotating through the pool.
    pub fn notify_one(&self) {
        let sleepers = self.sleepers.read();
        if sleepers.is_empty() {
            return;
        }
        let idx = self.next_wake.fetch_add(1, Ordering::Relaxed) % sleepers.len();
        if let Some(thread) = &sleepers[idx] {
            thread.unpark();
        }
    }

    pub fn notify_all(&self) {
        for thread in self.sleepers.read().iter().flatten() {
            thread.unpark();
        }
    }

    pub fn steal_global(&self, local: &Worker<T>) -> Option<T> {
        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Try every peer in random order, skipping worker `me`.
    pub fn steal_from_peers(&self, me: usize, local: &Worker<T>) -> Option<T> {
        if self.stealers.len() < 2 {
            return None;
        }

        let mut indices: Vec<usize> = (0..self.stealers.len()).collect();
        indices.shuffle(&mut thread_rng());

        for idx in indices {
            if idx == me {
                continue;
            }

            loop {
                match self.stealers[idx].steal_batch_and_pop(local) {
                    Steal::Success(item) => return Some(item),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(Stealer::is_empty)
    }
}

impl<T> std::fmt::Debug for WorkStealingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingQueue")
            .field("workers", &self.stealers.len())
            .field("injector_len", &self.injector.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_creation() {
        let (queue, workers) = WorkStealingQueue::<u32>::new(4);
        assert_eq!(queue.num_workers(), 4);
        assert_eq!(workers.len(), 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_global_queue() {
        let (queue, workers) = WorkStealingQueue::new(2);
        queue.push_global(7u32);
        assert!(!queue.is_empty());
        assert_eq!(queue.steal_global(&workers[1]), Some(7));
        assert!(queue.steal_global(&workers[1]).is_none());
    }

    #[test]
    fn test_steal_from_peer() {
        let (queue, workers) = WorkStealingQueue::new(3);
        workers[0].push(1u32);
        workers[0].push(2u32);

        let stolen = queue.steal_from_peers(2, &workers[2]);
        assert!(stolen.is_some());
        // a worker never steals from itself
        assert!(queue.steal_from_peers(0, &workers[0]).is_none() || workers[2].is_empty());
    }

    #[test]
    fn test_single_worker_never_steals() {
        let (queue, workers) = WorkStealingQueue::new(1);
        workers[0].push(1u32);
        assert!(queue.steal_from_peers(0, &workers[0]).is_none());
    }
}
