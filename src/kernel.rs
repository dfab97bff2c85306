//! Compiled kernels and their submission channels.

use crate::cache::ResourceCache;
use crate::device::Device;
use crate::dispatch::GroupLimits;
use crate::error::{Error, Result};
use crate::handle::{KernelHandle, KernelResource};
use parking_lot::Mutex;
use std::fmt;
use tracing::{debug, warn};

/// A dispatch-ready pipeline plus the queue it submits on.
pub struct Kernel<D: Device> {
    pub(crate) pipeline: D::Pipeline,
    /// One dispatch in flight per kernel.
    pub(crate) queue: Mutex<D::Queue>,
    pub(crate) limits: GroupLimits,
    pub(crate) entry_point: String,
}

impl<D: Device> fmt::Debug for Kernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("entry_point", &self.entry_point)
            .field("limits", &self.limits)
            .finish()
    }
}

pub(crate) type KernelCache<D> = ResourceCache<KernelResource, Kernel<D>>;

/// Compile `entry_point` from `source` and register it.
pub(crate) fn compile<D: Device>(
    device: &D,
    cache: &KernelCache<D>,
    source: &str,
    entry_point: &str,
) -> Result<KernelHandle> {
    if source.is_empty() {
        return Err(Error::MissingSource);
    }
    if entry_point.is_empty() {
        return Err(Error::MissingEntryPoint);
    }

    let module = device.compile_module(source)?;
    let pipeline = device.build_pipeline(&module, entry_point)?;
    let queue = device
        .create_queue(&pipeline)
        .map_err(|err| Error::QueueSetupFailed(err.to_string()))?;
    let limits = device.group_limits(&pipeline);

    let kernel = Kernel {
        pipeline,
        queue: Mutex::new(queue),
        limits,
        entry_point: entry_point.to_string(),
    };

    let handle = cache.store(kernel).map_err(|err| {
        warn!(entry_point, error = %err, "kernel registration failed, releasing pipeline");
        Error::CacheFailed(err)
    })?;

    debug!(
        handle = handle.raw(),
        entry_point,
        warp_width = limits.warp_width,
        max_group_threads = limits.max_group_threads,
        "compiled kernel"
    );

    Ok(handle)
}

/// Entry-point name of a compiled kernel, or `""` if `handle` does not
/// resolve.
pub(crate) fn name<D: Device>(device: &D, cache: &KernelCache<D>, handle: KernelHandle) -> String {
    if !handle.is_valid() {
        return String::new();
    }

    cache
        .retrieve(handle)
        .map(|kernel| device.entry_point_name(&kernel.pipeline))
        .unwrap_or_default()
}
