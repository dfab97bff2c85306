//! Grid normalization, thread-group sizing and kernel dispatch.

use crate::buffer::BufferCache;
use crate::device::{Bindings, Device, DeviceError};
use crate::error::{Error, Result};
use crate::handle::{BufferHandle, KernelHandle};
use crate::kernel::KernelCache;
use std::time::Duration;
use tracing::{debug, trace};

/// Caller-supplied problem size: independent work items per axis.
///
/// Axes `<= 0` are treated as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Grid {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Grid {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// A one-dimensional grid of `x` work items.
    pub const fn linear(x: i64) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn normalized(&self) -> GridSize {
        fn axis(v: i64) -> u64 {
            if v < 1 {
                1
            } else {
                v as u64
            }
        }

        GridSize {
            width: axis(self.x),
            height: axis(self.y),
            depth: axis(self.z),
        }
    }
}

impl From<(i64, i64, i64)> for Grid {
    fn from((x, y, z): (i64, i64, i64)) -> Self {
        Self::new(x, y, z)
    }
}

/// A normalized grid: every axis is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridSize {
    pub width: u64,
    pub height: u64,
    pub depth: u64,
}

impl GridSize {
    pub fn as_array(&self) -> [u64; 3] {
        [self.width, self.height, self.depth]
    }

    /// Total work items, `None` on overflow.
    pub fn total(&self) -> Option<u64> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(self.depth)
    }

    /// Axes as a `vec3<u32>` uniform padded to 16 bytes, `None` if an axis
    /// does not fit in `u32`.
    pub fn to_u32x4(&self) -> Option<[u32; 4]> {
        Some([
            u32::try_from(self.width).ok()?,
            u32::try_from(self.height).ok()?,
            u32::try_from(self.depth).ok()?,
            0,
        ])
    }
}

/// Threads bundled into one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadGroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadGroupSize {
    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn threads(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Groups needed per axis to cover `grid`, rounding up.
    pub fn groups_for(&self, grid: GridSize) -> [u64; 3] {
        let g = self.as_array();
        let mut out = [0u64; 3];
        for (axis, len) in grid.as_array().into_iter().enumerate() {
            out[axis] = len.div_ceil(u64::from(g[axis].max(1)));
        }
        out
    }
}

/// Threading limits a pipeline reports once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupLimits {
    /// Threads executed truly in parallel along one axis.
    pub warp_width: u32,
    /// Most threads allowed in one group.
    pub max_group_threads: u32,
}

impl GroupLimits {
    /// `(warp_width, max_group_threads / warp_width, 1)`.
    ///
    /// The shape does not depend on the grid; devices dispatch
    /// non-uniformly so partial groups at the edges are fine.
    pub fn thread_group(&self) -> ThreadGroupSize {
        let max = self.max_group_threads.max(1);
        let warp = self.warp_width.clamp(1, max);

        ThreadGroupSize {
            x: warp,
            y: max / warp,
            z: 1,
        }
    }
}

/// Resolve handles, size the dispatch and run it to completion.
pub(crate) fn run<D: Device>(
    device: &D,
    kernels: &KernelCache<D>,
    buffers: &BufferCache<D::Memory>,
    kernel: KernelHandle,
    grid: Grid,
    buffer_handles: &[BufferHandle],
    lock_timeout: Duration,
) -> Result<()> {
    let kernel = kernels
        .retrieve(kernel)
        .map_err(|_| Error::FunctionNotFound(kernel.raw()))?;

    let total = buffer_handles.len();
    let entries = buffer_handles
        .iter()
        .enumerate()
        .map(|(i, &handle)| {
            buffers.retrieve(handle).map_err(|_| Error::BufferNotFound {
                position: i + 1,
                total,
                handle: handle.raw(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let grid = grid.normalized();
    let group = kernel.limits.thread_group();
    debug!(
        kernel = %kernel.entry_point,
        grid = ?grid.as_array(),
        group = ?group.as_array(),
        buffers = total,
        "dispatching"
    );

    // Distinct blocks in ascending handle order; a handle bound twice is
    // locked once.
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by_key(|&i| buffer_handles[i]);
    order.dedup_by_key(|i| buffer_handles[*i]);
    let distinct: Vec<BufferHandle> = order.iter().map(|&i| buffer_handles[i]).collect();
    let slots: Vec<usize> = buffer_handles
        .iter()
        .map(|h| distinct.binary_search(h).unwrap_or_default())
        .collect();

    let mut queue = kernel.queue.lock();
    // A view guard held by the calling thread would otherwise block forever
    let mut locked = order
        .iter()
        .map(|&i| {
            entries[i].block.try_lock_for(lock_timeout).ok_or_else(|| {
                Error::DispatchFailed(DeviceError::CommandBuffer(format!(
                    "buffer {} is borrowed by the host",
                    buffer_handles[i].raw()
                )))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    trace!(blocks = locked.len(), "bound buffers locked");

    let mut bindings = Bindings::new(locked.iter_mut().map(|g| &mut **g).collect(), slots);
    device
        .dispatch(&mut queue, &kernel.pipeline, &mut bindings, grid, group)
        .map_err(Error::DispatchFailed)
}
