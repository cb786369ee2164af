//! The heterogeneous executor.
//!
//! Two worker pools share one [`Executor`]: host workers run host tasks and
//! device workers build, instantiate and replay device sub-graphs. Readiness
//! is tracked per run with atomic join counters, so several runs of the same
//! or different taskflows can be in flight at once.

pub mod panic_handler;
mod pool;
mod run;
mod worker;

pub use panic_handler::{PanicHandler, PanicStrategy};
pub use pool::Executor;
pub use run::RunHandle;
