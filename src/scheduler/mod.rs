//! Work-stealing queues shared by the worker pools.

pub mod work_stealing;

pub use work_stealing::WorkStealingQueue;
