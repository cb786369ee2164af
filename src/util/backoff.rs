//! Idle backoff for worker loops.

use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

/// Spin, then yield, then park with a timeout.
///
/// Parking is bounded so a worker that misses an unpark still re-checks its
/// queues shortly afterwards.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 16;
    const PARK_TIMEOUT: Duration = Duration::from_micros(200);

    pub fn new() -> Self {
        Self { step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Perform one step of backoff.
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::park_timeout(Self::PARK_TIMEOUT);
        }

        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Whether the next snooze parks the thread.
    pub fn is_parking(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
