//! Memory that device operations read and write.

use super::DeviceId;
use bytemuck::Pod;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Where an allocation nominally lives.
///
/// The emulated backend keeps every allocation in host memory, so placement is
/// descriptive. Accessing a `Device` buffer from another device without
/// unified memory is the caller's responsibility to avoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    Host,
    Device(DeviceId),
    Unified,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Host => write!(f, "host"),
            Placement::Device(id) => write!(f, "{}", id),
            Placement::Unified => write!(f, "unified"),
        }
    }
}

/// A fixed-length, shared allocation of plain-old-data elements.
///
/// Cloning a `Buffer` clones the handle, not the contents.
pub struct Buffer<T: Pod> {
    inner: Arc<BufferInner<T>>,
}

struct BufferInner<T: Pod> {
    id: u64,
    placement: Placement,
    data: RwLock<Vec<T>>,
}

impl<T: Pod + Send + Sync> Buffer<T> {
    pub fn from_vec(placement: Placement, data: Vec<T>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                placement,
                data: RwLock::new(data),
            }),
        }
    }

    pub fn zeroed(placement: Placement, len: usize) -> Self {
        Self::from_vec(placement, vec![T::zeroed(); len])
    }

    pub fn host(len: usize) -> Self {
        Self::zeroed(Placement::Host, len)
    }

    pub fn host_from(data: &[T]) -> Self {
        Self::from_vec(Placement::Host, data.to_vec())
    }

    pub fn on_device(device: DeviceId, len: usize) -> Self {
        Self::zeroed(Placement::Device(device), len)
    }

    pub fn unified(len: usize) -> Self {
        Self::zeroed(Placement::Unified, len)
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    pub fn placement(&self) -> Placement {
        self.inner.placement
    }

    /// Read one element. Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> T {
        self.inner.data.read()[index]
    }

    /// Write one element. Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: T) {
        self.inner.data.write()[index] = value;
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.inner.data.read().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.inner.data.read())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        f(&mut self.inner.data.write())
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &Buffer<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn memory(&self) -> Arc<dyn RawMemory> {
        self.inner.clone()
    }
}

impl<T: Pod> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Pod> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("placement", &self.inner.placement)
            .field("len", &self.inner.data.read().len())
            .finish()
    }
}

/// Untyped view of an allocation used by copy and fill operations.
pub(crate) trait RawMemory: Send + Sync {
    fn id(&self) -> u64;
    fn placement(&self) -> Placement;
    fn byte_len(&self) -> usize;
    /// Copy out the first `len` bytes.
    fn read_bytes(&self, len: usize) -> Vec<u8>;
    /// Overwrite the first `data.len()` bytes.
    fn write_bytes(&self, data: &[u8]);
}

impl<T: Pod + Send + Sync> RawMemory for BufferInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn byte_len(&self) -> usize {
        self.data.read().len() * std::mem::size_of::<T>()
    }

    fn read_bytes(&self, len: usize) -> Vec<u8> {
        let data = self.data.read();
        bytemuck::cast_slice::<T, u8>(&data)[..len].to_vec()
    }

    fn write_bytes(&self, bytes: &[u8]) {
        let mut data = self.data.write();
        bytemuck::cast_slice_mut::<T, u8>(&mut data)[..bytes.len()].copy_from_slice(bytes);
    }
}

impl fmt::Debug for dyn RawMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMemory")
            .field("id", &self.id())
            .field("placement", &self.placement())
            .field("bytes", &self.byte_len())
            .finish()
    }
}
