//! The runtime object: one device plus the kernel and buffer caches.

use crate::buffer::{self, BufferCache, BufferInfo, Element, View1, View2, View3};
use crate::config::Config;
use crate::device::Device;
use crate::dispatch::{self, Grid, ThreadGroupSize};
use crate::error::{Error, Result};
use crate::handle::{BufferHandle, KernelHandle};
use crate::kernel::{self, KernelCache};
use crate::telemetry::Metrics;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Compiles kernels, allocates buffers and dispatches work on one device.
///
/// Every runtime owns its own caches, so several runtimes can live in one
/// process without sharing handles. All methods take `&self` and may be
/// called from any number of threads.
pub struct Runtime<D: Device> {
    device: Arc<D>,
    kernels: KernelCache<D>,
    buffers: BufferCache<D::Memory>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl<D: Device> Runtime<D> {
    pub fn new(device: D, config: Config) -> Result<Self> {
        Self::with_shared_device(Arc::new(device), config)
    }

    /// Build a runtime over a device that other runtimes may also use.
    pub fn with_shared_device(device: Arc<D>, config: Config) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "telemetry")]
        let metrics = if config.enable_telemetry {
            Metrics::new()
        } else {
            Metrics::disabled()
        };
        #[cfg(not(feature = "telemetry"))]
        let metrics = Metrics::new();

        info!(device = %device.name(), "runtime ready");

        Ok(Self {
            kernels: KernelCache::with_limit(config.max_kernels),
            buffers: BufferCache::with_limit(config.max_buffers),
            device,
            metrics: Arc::new(metrics),
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Compile `entry_point` from `source`.
    ///
    /// An empty `source` is reported before an empty `entry_point`.
    pub fn compile_kernel(&self, source: &str, entry_point: &str) -> Result<KernelHandle> {
        let result = kernel::compile(&*self.device, &self.kernels, source, entry_point);
        self.metrics.record_compile(result.is_ok());
        result
    }

    /// Entry-point name of a compiled kernel; empty if `handle` is invalid
    /// or unknown.
    pub fn kernel_name(&self, handle: KernelHandle) -> String {
        kernel::name(&*self.device, &self.kernels, handle)
    }

    /// Thread-group shape dispatches of `kernel` use.
    pub fn thread_group(&self, kernel: KernelHandle) -> Result<ThreadGroupSize> {
        self.kernels
            .retrieve(kernel)
            .map(|k| k.limits.thread_group())
            .map_err(|_| Error::FunctionNotFound(kernel.raw()))
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.live()
    }

    fn allocate<T: Element>(&self, dims: &[i64]) -> Result<buffer::Allocation> {
        let result = buffer::allocate::<D, T>(&*self.device, &self.buffers, dims);
        match &result {
            Ok(alloc) => {
                let bytes = alloc.shape.byte_len(std::mem::size_of::<T>()).unwrap_or(0);
                self.metrics.record_allocation(bytes);
            }
            Err(_) => self.metrics.record_allocation_failure(),
        }
        result
    }

    /// Allocate a zeroed buffer of `len` elements.
    pub fn new_buffer_1d<T: Element>(&self, len: i64) -> Result<(BufferHandle, View1<T>)> {
        let alloc = self.allocate::<T>(&[len])?;
        let dims = alloc.shape.dims();
        let view = View1::new(alloc.handle, alloc.block, dims[0]);
        Ok((alloc.handle, view))
    }

    /// Allocate a zeroed `rows x cols` buffer, stored row-major.
    pub fn new_buffer_2d<T: Element>(
        &self,
        rows: i64,
        cols: i64,
    ) -> Result<(BufferHandle, View2<T>)> {
        let alloc = self.allocate::<T>(&[rows, cols])?;
        let dims = alloc.shape.dims();
        let view = View2::new(alloc.handle, alloc.block, dims[0], dims[1]);
        Ok((alloc.handle, view))
    }

    /// Allocate a zeroed `layers x rows x cols` buffer, stored row-major.
    pub fn new_buffer_3d<T: Element>(
        &self,
        layers: i64,
        rows: i64,
        cols: i64,
    ) -> Result<(BufferHandle, View3<T>)> {
        let alloc = self.allocate::<T>(&[layers, rows, cols])?;
        let dims = alloc.shape.dims();
        let view = View3::new(alloc.handle, alloc.block, [dims[0], dims[1], dims[2]]);
        Ok((alloc.handle, view))
    }

    pub fn buffer_info(&self, handle: BufferHandle) -> Result<BufferInfo> {
        let entry = self
            .buffers
            .retrieve(handle)
            .map_err(|_| Error::BufferNotFound {
                position: 1,
                total: 1,
                handle: handle.raw(),
            })?;
        Ok(BufferInfo::from(&*entry))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.live()
    }

    /// Run `kernel` over `grid` with `buffers` bound as its arguments, in
    /// order, and block until it completes.
    ///
    /// Grid axes `<= 0` count as 1. Results are read through the buffers'
    /// views once this returns.
    ///
    /// Bound buffers must not be borrowed through a view guard. The call
    /// waits up to [`Config::buffer_lock_timeout`] for outstanding guards
    /// and then fails with [`DeviceError::CommandBuffer`].
    ///
    /// [`DeviceError::CommandBuffer`]: crate::device::DeviceError::CommandBuffer
    pub fn dispatch(
        &self,
        kernel: KernelHandle,
        grid: impl Into<Grid>,
        buffers: &[BufferHandle],
    ) -> Result<()> {
        let start = Instant::now();
        let result = dispatch::run(
            &*self.device,
            &self.kernels,
            &self.buffers,
            kernel,
            grid.into(),
            buffers,
            self.config.buffer_lock_timeout,
        );

        match &result {
            Ok(()) => self.metrics.record_dispatch(start.elapsed()),
            Err(err) => {
                warn!(kernel = kernel.raw(), error = %err, "dispatch failed");
                self.metrics.record_dispatch_failure();
            }
        }
        result
    }
}

impl Runtime<crate::device::HostDevice> {
    /// A runtime on the host backend.
    pub fn host(config: Config) -> Result<Self> {
        let device = crate::device::HostDevice::new(&config)?;
        Self::new(device, config)
    }
}

#[cfg(feature = "gpu")]
impl Runtime<crate::device::GpuDevice> {
    /// A runtime on the preferred GPU adapter.
    pub fn gpu(config: Config) -> Result<Self> {
        let device = crate::device::GpuDevice::new(&config)?;
        Self::new(device, config)
    }
}

impl<D: Device> fmt::Debug for Runtime<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("device", &self.device.name())
            .field("kernels", &self.kernels.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const SCALE: &str = "
        @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
        fn scale() {}
    ";

    fn runtime() -> Runtime<crate::device::HostDevice> {
        let rt = Runtime::host(Config::builder().worker_threads(2).build().unwrap()).unwrap();
        rt.device().register_kernel("scale", |inv, args| {
            let i = inv.linear_index() as usize;
            args.store(0, i, args.load::<i32>(0, i) * 3);
        });
        rt
    }

    #[test]
    fn test_independent_runtimes() {
        let a = runtime();
        let b = runtime();

        let ka = a.compile_kernel(SCALE, "scale").unwrap();
        let kb = b.compile_kernel(SCALE, "scale").unwrap();
        assert_eq!(ka.raw(), 1);
        assert_eq!(kb.raw(), 1);

        let (buf, _) = a.new_buffer_1d::<i32>(4).unwrap();
        assert!(b.buffer_info(buf).is_err());
        assert_eq!(a.buffer_count(), 1);
        assert_eq!(b.buffer_count(), 0);
    }

    #[test]
    fn test_buffer_info() {
        let rt = runtime();
        let (handle, view) = rt.new_buffer_3d::<f64>(2, 3, 4).unwrap();

        let info = rt.buffer_info(handle).unwrap();
        assert_eq!(info.byte_len, 2 * 3 * 4 * 8);
        assert_eq!(info.element_size, 8);
        assert_eq!(info.shape.dims(), &[2, 3, 4]);
        assert_eq!(view.shape(), [2, 3, 4]);
        assert_eq!(view.handle(), handle);
    }

    #[test]
    fn test_dispatch_2d_grid() {
        let rt = runtime();
        let kernel = rt.compile_kernel(SCALE, "scale").unwrap();
        let (handle, view) = rt.new_buffer_2d::<i32>(5, 7).unwrap();

        {
            let mut rows = view.write();
            for (i, row) in rows.nested_mut().into_iter().enumerate() {
                for (j, v) in row.iter_mut().enumerate() {
                    *v = (i * 7 + j) as i32;
                }
            }
        }

        // x runs along columns, y along rows
        rt.dispatch(kernel, Grid::new(7, 5, 0), &[handle]).unwrap();

        let rows = view.read();
        for i in 0..5 {
            for j in 0..7 {
                assert_eq!(rows[i][j], (i * 7 + j) as i32 * 3);
            }
        }
    }

    #[test]
    fn test_thread_group_follows_config() {
        let config = Config::builder()
            .warp_width(16)
            .max_group_threads(128)
            .build()
            .unwrap();
        let rt = Runtime::host(config).unwrap();
        rt.device().register_kernel("scale", |_, _| {});

        let kernel = rt.compile_kernel(SCALE, "scale").unwrap();
        assert_eq!(rt.thread_group(kernel).unwrap().as_array(), [16, 8, 1]);

        let err = rt.thread_group(KernelHandle::from_raw(7)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cache_limits_from_config() {
        let config = Config::builder().max_buffers(2).build().unwrap();
        let rt = Runtime::host(config).unwrap();

        rt.new_buffer_1d::<u8>(8).unwrap();
        rt.new_buffer_1d::<u8>(8).unwrap();
        let err = rt.new_buffer_1d::<u8>(8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CacheFailure);
        assert_eq!(rt.device().live_bytes(), 16);
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_metrics_track_operations() {
        let rt = runtime();
        let kernel = rt.compile_kernel(SCALE, "scale").unwrap();
        assert!(rt.compile_kernel("", "scale").is_err());
        let (buf, _) = rt.new_buffer_1d::<i32>(10).unwrap();

        rt.dispatch(kernel, Grid::linear(10), &[buf]).unwrap();
        assert!(rt.dispatch(kernel, Grid::linear(10), &[BufferHandle::INVALID]).is_err());

        let snapshot = rt.metrics().snapshot();
        assert_eq!(snapshot.kernels_compiled, 1);
        assert_eq!(snapshot.compile_failures, 1);
        assert_eq!(snapshot.buffers_allocated, 1);
        assert_eq!(snapshot.bytes_allocated, 40);
        assert_eq!(snapshot.dispatches, 1);
        assert_eq!(snapshot.dispatch_failures, 1);
    }
}
