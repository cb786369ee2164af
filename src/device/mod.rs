//! Device sub-graphs: capture, instantiation, caching and replay.
//!
//! A device task receives a [`DeviceFlow`] and describes kernel launches,
//! copies and fills with explicit dependencies. The first time the task runs,
//! the captured nodes are instantiated into a native graph by a
//! [`DeviceBackend`]; later runs and `repeat`/`predicate` iterations replay
//! that graph without rebuilding it.

pub mod backend;
pub mod buffer;
pub(crate) mod cache;
pub mod emulator;
pub mod flow;
pub mod geometry;
pub mod node;

pub use backend::{DeviceBackend, GraphHandle};
pub use buffer::{Buffer, Placement};
pub use emulator::Emulator;
pub use flow::DeviceFlow;
pub use geometry::{Dim3, KernelContext, LaunchGeometry};
pub use node::{CapturedGraph, DeviceNode, OpKind};

use crate::config::Config;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Ordinal of an accelerator, always in `[0, device_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0
    }

    /// Validate a caller-supplied ordinal against the device count.
    pub fn resolve(id: i64, device_count: usize) -> Result<Self> {
        if id < 0 || id as u64 >= device_count as u64 {
            return Err(Error::InvalidDevice {
                id,
                count: device_count,
            });
        }
        Ok(DeviceId(id as usize))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Backend used when an executor is built from a [`Config`] alone.
pub fn default_backend(config: &Config) -> Result<Arc<dyn DeviceBackend>> {
    let emulator = Emulator::new(config.devices, config.max_graph_nodes)?;
    Ok(Arc::new(emulator))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bounds() {
        assert_eq!(DeviceId::resolve(0, 2).unwrap(), DeviceId(0));
        assert_eq!(DeviceId::resolve(1, 2).unwrap(), DeviceId(1));
        assert!(matches!(
            DeviceId::resolve(-1, 2),
            Err(Error::InvalidDevice { id: -1, count: 2 })
        ));
        assert!(DeviceId::resolve(2, 2).is_err());
        assert!(DeviceId::resolve(0, 0).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId(3).to_string(), "device 3");
    }
}
