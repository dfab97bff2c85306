//! Shared buffers and their multi-dimensional views.

pub mod shape;
pub mod view;

pub use shape::Shape;
pub use view::{Planes, PlanesMut, Rows, RowsMut, View1, View2, View3};

use crate::cache::ResourceCache;
use crate::device::{Device, DeviceMemory};
use crate::error::{Error, Result};
use crate::handle::{BufferHandle, BufferResource};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::mem::{align_of, size_of};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use view::BlockAccess;

mod sealed {
    pub trait Sealed {}
}

/// Plain numeric types a buffer can hold.
///
/// Every bit pattern is a valid value and zeroed memory reads as
/// `T::default()`.
pub trait Element:
    bytemuck::Pod + Default + std::fmt::Debug + Send + Sync + sealed::Sealed + 'static
{
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Element for $t {}
        )*
    };
}

impl_element!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// Device memory guarded for host/device exclusion.
pub(crate) struct SharedBlock<M> {
    memory: RwLock<M>,
}

impl<M: DeviceMemory> SharedBlock<M> {
    fn new(memory: M) -> Self {
        Self {
            memory: RwLock::new(memory),
        }
    }

    /// Exclusive access for the duration of a dispatch, or `None` if a
    /// view guard is still held after `timeout`.
    pub(crate) fn try_lock_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, M>> {
        self.memory.try_write_for(timeout)
    }
}

impl<M: DeviceMemory> BlockAccess for SharedBlock<M> {
    fn read_bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.memory.read(), |m| m.as_bytes())
    }

    fn write_bytes(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.memory.write(), |m| m.as_bytes_mut())
    }
}

/// Cache entry for an allocated buffer.
pub(crate) struct BufferEntry<M> {
    pub(crate) block: Arc<SharedBlock<M>>,
    pub(crate) shape: Shape,
    pub(crate) element_size: usize,
    pub(crate) byte_len: usize,
}

pub(crate) type BufferCache<M> = ResourceCache<BufferResource, BufferEntry<M>>;

/// Layout of an allocated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub byte_len: usize,
    pub element_size: usize,
    pub shape: Shape,
}

impl<M> From<&BufferEntry<M>> for BufferInfo {
    fn from(entry: &BufferEntry<M>) -> Self {
        Self {
            byte_len: entry.byte_len,
            element_size: entry.element_size,
            shape: entry.shape.clone(),
        }
    }
}

/// A freshly registered buffer, ready to be wrapped in a view.
pub(crate) struct Allocation {
    pub(crate) handle: BufferHandle,
    pub(crate) block: Arc<dyn BlockAccess>,
    pub(crate) shape: Shape,
}

/// Allocate shared memory for `dims` elements of `T` and register it.
///
/// If registration fails the device memory is dropped, which releases it.
pub(crate) fn allocate<D: Device, T: Element>(
    device: &D,
    cache: &BufferCache<D::Memory>,
    dims: &[i64],
) -> Result<Allocation> {
    let shape = Shape::from_dims(dims)?;
    let element_size = size_of::<T>();
    let byte_len = shape.byte_len(element_size).ok_or_else(|| {
        Error::invalid_dimensions(format!("{} x {} bytes overflows", shape, element_size))
    })?;

    let memory = device.allocate(byte_len)?;
    if memory.len() != byte_len {
        return Err(Error::AllocationFailed(format!(
            "device returned {} bytes, {} requested",
            memory.len(),
            byte_len
        )));
    }
    if memory.as_bytes().as_ptr() as usize % align_of::<T>() != 0 {
        return Err(Error::AllocationFailed(format!(
            "device memory is not aligned for {}",
            std::any::type_name::<T>()
        )));
    }

    let block = Arc::new(SharedBlock::new(memory));
    let entry = BufferEntry {
        block: Arc::clone(&block),
        shape: shape.clone(),
        element_size,
        byte_len,
    };

    let handle = cache.store(entry).map_err(|err| {
        warn!(bytes = byte_len, error = %err, "buffer registration failed, releasing memory");
        Error::CacheFailed(err)
    })?;

    debug!(
        handle = handle.raw(),
        shape = %shape,
        bytes = byte_len,
        element = std::any::type_name::<T>(),
        "allocated buffer"
    );

    Ok(Allocation {
        handle,
        block,
        shape,
    })
}
