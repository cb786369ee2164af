//! Kernel launch geometry and the per-thread context handed to kernel bodies.

use super::DeviceId;
use crate::error::{Error, Result};
use std::fmt;

/// Three-dimensional extent or index, as used by grid and block shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Total number of elements covered by this extent.
    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::linear(x)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Grid and block dimensions plus dynamic shared memory for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGeometry {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: usize,
}

impl LaunchGeometry {
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
        }
    }

    /// One-dimensional launch covering at least `n` threads.
    ///
    /// The grid saturates at `u32::MAX` blocks; use
    /// [`try_for_elements`](Self::try_for_elements) to reject such sizes.
    pub fn for_elements(n: usize, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let blocks = u32::try_from(blocks_for(n, block_size)).unwrap_or(u32::MAX);
        Self::new(blocks, block_size)
    }

    /// Like [`for_elements`](Self::for_elements), but fails instead of
    /// covering fewer than `n` threads.
    pub fn try_for_elements(n: usize, block_size: u32) -> Result<Self> {
        let block_size = block_size.max(1);
        let blocks = blocks_for(n, block_size);
        let blocks = u32::try_from(blocks).map_err(|_| {
            Error::invalid_argument(format!(
                "{} elements need {} blocks of {}, more than a grid can hold",
                n, blocks, block_size
            ))
        })?;
        Ok(Self::new(blocks, block_size))
    }

    pub fn with_shared_mem(mut self, bytes: usize) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid {} block {} smem {}",
            self.grid, self.block, self.shared_mem_bytes
        )
    }
}

fn blocks_for(n: usize, block_size: u32) -> u64 {
    (n as u64).div_ceil(u64::from(block_size)).max(1)
}

/// Coordinates of the logical thread a kernel body is running as.
#[derive(Debug, Clone, Copy)]
pub struct KernelContext {
    pub device: DeviceId,
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    pub block_idx: Dim3,
    pub thread_idx: Dim3,
}

impl KernelContext {
    pub fn global_x(&self) -> usize {
        self.block_idx.x as usize * self.block_dim.x as usize + self.thread_idx.x as usize
    }

    pub fn global_y(&self) -> usize {
        self.block_idx.y as usize * self.block_dim.y as usize + self.thread_idx.y as usize
    }

    pub fn global_z(&self) -> usize {
        self.block_idx.z as usize * self.block_dim.z as usize + self.thread_idx.z as usize
    }

    /// Total number of threads along x across the whole grid.
    pub fn grid_stride_x(&self) -> usize {
        self.grid_dim.x as usize * self.block_dim.x as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_elements_rounds_up() {
        let geometry = LaunchGeometry::for_elements(1000, 256);
        assert_eq!(geometry.grid, Dim3::linear(4));
        assert_eq!(geometry.block, Dim3::linear(256));
        assert_eq!(geometry.total_threads(), 1024);

        let geometry = LaunchGeometry::for_elements(0, 128);
        assert_eq!(geometry.grid.x, 1);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_oversized_grid_saturates_or_fails() {
        let geometry = LaunchGeometry::for_elements(usize::MAX, 1);
        assert_eq!(geometry.grid.x, u32::MAX);

        assert!(matches!(
            LaunchGeometry::try_for_elements(usize::MAX, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            LaunchGeometry::try_for_elements(1000, 256).unwrap(),
            LaunchGeometry::for_elements(1000, 256)
        );
    }

    #[test]
    fn test_global_index() {
        let ctx = KernelContext {
            device: DeviceId(0),
            grid_dim: Dim3::linear(4),
            block_dim: Dim3::linear(32),
            block_idx: Dim3::new(2, 0, 0),
            thread_idx: Dim3::new(5, 0, 0),
        };
        assert_eq!(ctx.global_x(), 69);
        assert_eq!(ctx.grid_stride_x(), 128);
    }

    #[test]
    fn test_dim3_conversions() {
        assert_eq!(Dim3::from((2, 3)).volume(), 6);
        assert!(Dim3::new(4, 0, 1).is_empty());
    }
}
