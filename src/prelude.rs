pub use crate::config::{Config, ConfigBuilder};
pub use crate::device::{
    Buffer, DeviceBackend, DeviceFlow, DeviceId, DeviceNode, Dim3, Emulator, KernelContext,
    LaunchGeometry, OpKind, Placement,
};
pub use crate::error::{Error, Result};
pub use crate::executor::{Executor, PanicStrategy, RunHandle};
pub use crate::graph::{Task, TaskKind, Taskflow};
pub use crate::telemetry::MetricsSnapshot;
