//! heteroflow - heterogeneous host/device task graphs
//!
//! Build a [`Taskflow`] of host tasks and device tasks, wire up their
//! dependencies and hand it to an [`Executor`]. Device tasks describe a small
//! graph of kernel launches, copies and fills through a
//! [`DeviceFlow`](device::DeviceFlow); that graph is instantiated on first
//! use and replayed on every later run.
//!
//! # Quick Start
//!
//! ```
//! use heteroflow::prelude::*;
//!
//! # fn main() -> heteroflow::Result<()> {
//! const N: usize = 1024;
//!
//! let executor = Executor::new(Config::default())?;
//! let taskflow = Taskflow::with_name("saxpy");
//!
//! let x = Buffer::<f32>::host(N);
//! let y = Buffer::<f32>::host(N);
//! let dx = Buffer::<f32>::on_device(DeviceId(0), N);
//! let dy = Buffer::<f32>::on_device(DeviceId(0), N);
//!
//! let (hx, hy) = (x.clone(), y.clone());
//! let init = taskflow.emplace(move || {
//!     hx.with_mut(|data| data.fill(1.0));
//!     hy.with_mut(|data| data.fill(2.0));
//! })?;
//!
//! let (hx, hy) = (x.clone(), y.clone());
//! let saxpy = taskflow.emplace_device(move |flow| {
//!     let h2d_x = flow.copy(&dx, &hx, N)?;
//!     let h2d_y = flow.copy(&dy, &hy, N)?;
//!     let (kx, ky) = (dx.clone(), dy.clone());
//!     let kernel = flow.kernel(LaunchGeometry::for_elements(N, 256), move |ctx| {
//!         let i = ctx.global_x();
//!         if i < N {
//!             ky.set(i, 2.0 * kx.get(i) + ky.get(i));
//!         }
//!     })?;
//!     let d2h = flow.copy(&hy, &dy, N)?;
//!     kernel.succeed([&h2d_x, &h2d_y])?.precede([&d2h])?;
//!     Ok(())
//! })?;
//! init.precede([&saxpy])?;
//!
//! executor.run(&taskflow)?.wait()?;
//! assert!(y.to_vec().iter().all(|&v| v == 4.0));
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Work Stealing**: separate host and device pools with randomized stealing
//! - **Device Graphs**: capture once, instantiate once, replay with `repeat` or a predicate
//! - **Multiple Devices**: per-node device selection within one device task
//! - **Telemetry**: counters plus a latency histogram (`telemetry` feature)

#![warn(missing_debug_implementations)]

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod graph;
pub mod prelude;
pub mod scheduler;
pub mod telemetry;
pub mod util;

pub use config::{Config, ConfigBuilder};
pub use device::{Buffer, DeviceFlow, DeviceId, DeviceNode, LaunchGeometry};
pub use error::{Error, Result};
pub use executor::{Executor, RunHandle};
pub use graph::{Task, TaskKind, Taskflow};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn executor() -> Executor {
        Executor::new(Config::builder().host_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_host_chain() {
        let executor = executor();
        let taskflow = Taskflow::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let tasks: Vec<Task> = (0..4)
            .map(|i| {
                let order = order.clone();
                taskflow.emplace(move || order.lock().push(i)).unwrap()
            })
            .collect();
        for pair in tasks.windows(2) {
            pair[0].precede([&pair[1]]).unwrap();
        }

        executor.run(&taskflow).unwrap().wait().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_device_task_scales_buffer() {
        let executor = executor();
        let taskflow = Taskflow::new();
        let data = Buffer::host_from(&[1u32, 2, 3, 4]);

        let buffer = data.clone();
        taskflow
            .emplace_device(move |flow| {
                let buffer = buffer.clone();
                flow.kernel(LaunchGeometry::for_elements(4, 2), move |ctx| {
                    let i = ctx.global_x();
                    buffer.set(i, buffer.get(i) * 10);
                })?;
                Ok(())
            })
            .unwrap();

        executor.run(&taskflow).unwrap().wait().unwrap();
        assert_eq!(data.to_vec(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_failure_surfaces_on_wait() {
        let executor = executor();
        let taskflow = Taskflow::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let failing = taskflow
            .emplace_fallible(|| Err(Error::task_failed("load", "missing input")))
            .unwrap();
        let r = ran.clone();
        let after = taskflow
            .emplace(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        failing.precede([&after]).unwrap();

        let result = executor.run(&taskflow).unwrap().wait();
        assert!(matches!(result, Err(Error::TaskFailed { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(executor.metrics().tasks_skipped, 1);
    }
}
