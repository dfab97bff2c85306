//! Reference backend that runs kernels on host worker threads.
//!
//! Kernel source is scanned for compute entry points, and each entry point
//! runs a Rust closure registered under the same name. Thread groups are
//! spread over worker threads; only invocations inside the grid run, so
//! partial groups at the edges are clipped exactly as on hardware with
//! non-uniform dispatch.

use super::{source, Bindings, Device, DeviceError, DeviceMemory, DeviceResult};
use crate::buffer::Element;
use crate::config::Config;
use crate::dispatch::{GridSize, GroupLimits, ThreadGroupSize};
use crate::error::Result;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default threads per group when the config sets no cap.
pub const DEFAULT_MAX_GROUP_THREADS: u32 = 1024;

/// Most buffers a single dispatch can bind.
pub const MAX_BINDINGS: usize = 31;

type KernelFn = dyn Fn(&Invocation, &HostArgs<'_>) + Send + Sync;

/// Position of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// Position in the grid.
    pub position: [u64; 3],
    /// Group the invocation belongs to.
    pub group: [u64; 3],
    /// Position within the group.
    pub thread: [u32; 3],
    /// Normalized grid size of the dispatch.
    pub grid: [u64; 3],
}

impl Invocation {
    /// Row-major linear index of `position` in the grid.
    pub fn linear_index(&self) -> u64 {
        let [w, h, _] = self.grid;
        self.position[0] + self.position[1] * w + self.position[2] * w * h
    }
}

#[derive(Clone, Copy)]
struct RawBlock {
    ptr: *mut u8,
    len: usize,
}

// Blocks are write-locked by the runtime for the whole dispatch.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

/// Buffers bound to a host kernel, by argument index.
///
/// Reads past the end of a buffer return zero and writes past the end are
/// dropped.
pub struct HostArgs<'a> {
    blocks: &'a [RawBlock],
}

impl<'a> HostArgs<'a> {
    /// Number of bound arguments.
    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    /// Length of argument `binding` in elements of `T`.
    pub fn len<T: Element>(&self, binding: usize) -> usize {
        self.blocks
            .get(binding)
            .map_or(0, |block| block.len / size_of::<T>())
    }

    fn element_ptr<T: Element>(&self, binding: usize, index: usize) -> Option<*mut T> {
        let block = self.blocks.get(binding)?;
        let offset = index.checked_mul(size_of::<T>())?;
        if offset.checked_add(size_of::<T>())? > block.len {
            return None;
        }
        // SAFETY: offset + size_of::<T>() is within the block.
        Some(unsafe { block.ptr.add(offset) }.cast::<T>())
    }

    pub fn load<T: Element>(&self, binding: usize, index: usize) -> T {
        match self.element_ptr::<T>(binding, index) {
            // SAFETY: in bounds; any bit pattern is a valid `T`.
            Some(ptr) => unsafe { ptr.read_unaligned() },
            None => T::default(),
        }
    }

    pub fn store<T: Element>(&self, binding: usize, index: usize, value: T) {
        if let Some(ptr) = self.element_ptr::<T>(binding, index) {
            // SAFETY: in bounds, and the block is exclusively held by this
            // dispatch.
            unsafe { ptr.write_unaligned(value) }
        }
    }
}

impl fmt::Debug for HostArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.blocks.iter().map(|b| b.len))
            .finish()
    }
}

/// Host-visible memory handed out by [`HostDevice`].
pub struct HostMemory {
    words: Vec<u64>,
    len: usize,
    live: Arc<AtomicUsize>,
}

impl DeviceMemory for HostMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(self.len, Ordering::Relaxed);
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.len).finish()
    }
}

/// Entry points found in a kernel source.
#[derive(Debug, Clone)]
pub struct HostModule {
    entry_points: Vec<String>,
}

pub struct HostPipeline {
    entry_point: String,
    kernel: Arc<KernelFn>,
    limits: GroupLimits,
}

impl fmt::Debug for HostPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPipeline")
            .field("entry_point", &self.entry_point)
            .field("limits", &self.limits)
            .finish()
    }
}

#[derive(Debug)]
pub struct HostQueue {
    label: String,
    submitted: u64,
}

impl HostQueue {
    /// Dispatches completed on this queue.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

/// CPU implementation of the device-capability interface.
pub struct HostDevice {
    kernels: RwLock<HashMap<String, Arc<KernelFn>>>,
    limits: GroupLimits,
    workers: usize,
    max_allocation: Option<usize>,
    live: Arc<AtomicUsize>,
    label: String,
}

impl HostDevice {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let max_group_threads = config
            .max_group_threads
            .unwrap_or(DEFAULT_MAX_GROUP_THREADS)
            .min(DEFAULT_MAX_GROUP_THREADS);

        let device = Self {
            kernels: RwLock::new(HashMap::new()),
            limits: GroupLimits {
                warp_width: config.warp_width,
                max_group_threads,
            },
            workers: config.worker_threads(),
            max_allocation: config.max_allocation_bytes,
            live: Arc::new(AtomicUsize::new(0)),
            label: config.label("host"),
        };

        debug!(
            workers = device.workers,
            warp_width = device.limits.warp_width,
            max_group_threads,
            "host device ready"
        );

        Ok(device)
    }

    /// Provide the body of entry point `name`.
    ///
    /// Invocations of one dispatch run concurrently: a kernel must not
    /// write an element that another invocation of the same dispatch reads
    /// or writes.
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&Invocation, &HostArgs<'_>) + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.into(), Arc::new(kernel));
    }

    /// Bytes currently allocated and not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("label", &self.label)
            .field("workers", &self.workers)
            .field("limits", &self.limits)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}

/// Run every in-grid invocation of one group.
fn run_group(
    kernel: &KernelFn,
    args: &HostArgs<'_>,
    grid: [u64; 3],
    group: [u32; 3],
    id: [u64; 3],
) {
    let base = [
        id[0] * group[0] as u64,
        id[1] * group[1] as u64,
        id[2] * group[2] as u64,
    ];

    for tz in 0..group[2] {
        let z = base[2] + tz as u64;
        if z >= grid[2] {
            break;
        }
        for ty in 0..group[1] {
            let y = base[1] + ty as u64;
            if y >= grid[1] {
                break;
            }
            for tx in 0..group[0] {
                let x = base[0] + tx as u64;
                if x >= grid[0] {
                    break;
                }
                let invocation = Invocation {
                    position: [x, y, z],
                    group: id,
                    thread: [tx, ty, tz],
                    grid,
                };
                kernel(&invocation, args);
            }
        }
    }
}

impl Device for HostDevice {
    type Module = HostModule;
    type Pipeline = HostPipeline;
    type Queue = HostQueue;
    type Memory = HostMemory;

    fn name(&self) -> String {
        self.label.clone()
    }

    fn compile_module(&self, source: &str) -> DeviceResult<HostModule> {
        let entry_points = source::entry_points(source).map_err(DeviceError::ModuleBuild)?;
        Ok(HostModule { entry_points })
    }

    fn build_pipeline(
        &self,
        module: &HostModule,
        entry_point: &str,
    ) -> DeviceResult<HostPipeline> {
        if !module.entry_points.iter().any(|e| e == entry_point) {
            return Err(DeviceError::EntryPointNotFound(entry_point.to_string()));
        }

        let kernel = self.kernels.read().get(entry_point).cloned().ok_or_else(|| {
            DeviceError::PipelineBuild(format!(
                "no host implementation registered for '{}'",
                entry_point
            ))
        })?;

        Ok(HostPipeline {
            entry_point: entry_point.to_string(),
            kernel,
            limits: self.limits,
        })
    }

    fn group_limits(&self, pipeline: &HostPipeline) -> GroupLimits {
        pipeline.limits
    }

    fn entry_point_name(&self, pipeline: &HostPipeline) -> String {
        pipeline.entry_point.clone()
    }

    fn create_queue(&self, pipeline: &HostPipeline) -> DeviceResult<HostQueue> {
        Ok(HostQueue {
            label: format!("{}-{}", self.label, pipeline.entry_point),
            submitted: 0,
        })
    }

    fn allocate(&self, len: usize) -> DeviceResult<HostMemory> {
        if len == 0 {
            return Err(DeviceError::Allocation("zero-length allocation".to_string()));
        }
        if let Some(max) = self.max_allocation {
            if len > max {
                return Err(DeviceError::Allocation(format!(
                    "requested {} bytes exceeds device limit of {} bytes",
                    len, max
                )));
            }
        }

        let mut words = Vec::new();
        words
            .try_reserve_exact(len.div_ceil(size_of::<u64>()))
            .map_err(|e| DeviceError::Allocation(format!("{} bytes: {}", len, e)))?;
        words.resize(len.div_ceil(size_of::<u64>()), 0);

        self.live.fetch_add(len, Ordering::Relaxed);
        Ok(HostMemory {
            words,
            len,
            live: Arc::clone(&self.live),
        })
    }

    fn dispatch(
        &self,
        queue: &mut HostQueue,
        pipeline: &HostPipeline,
        bindings: &mut Bindings<'_, HostMemory>,
        grid: GridSize,
        group: ThreadGroupSize,
    ) -> DeviceResult<()> {
        // Command buffer
        let invocations = grid.total().ok_or_else(|| {
            DeviceError::CommandBuffer(format!(
                "grid {:?} exceeds the addressable number of work items",
                grid.as_array()
            ))
        })?;

        // Encoder
        if bindings.len() > MAX_BINDINGS {
            return Err(DeviceError::Encoder(format!(
                "{} buffers bound, at most {} supported",
                bindings.len(),
                MAX_BINDINGS
            )));
        }
        if group.threads() == 0 || group.threads() > pipeline.limits.max_group_threads as u64 {
            return Err(DeviceError::Encoder(format!(
                "thread group {:?} exceeds {} threads",
                group.as_array(),
                pipeline.limits.max_group_threads
            )));
        }

        let distinct: Vec<RawBlock> = bindings
            .blocks_mut()
            .map(|m| {
                let bytes = m.as_bytes_mut();
                RawBlock {
                    ptr: bytes.as_mut_ptr(),
                    len: bytes.len(),
                }
            })
            .collect();
        let blocks: Vec<RawBlock> = bindings.slots().iter().map(|&s| distinct[s]).collect();
        let args = HostArgs { blocks: &blocks };

        // Submission
        let counts = group.groups_for(grid);
        let total_groups = counts[0] * counts[1] * counts[2];
        let workers = (self.workers as u64).min(total_groups).max(1) as usize;
        let grid = grid.as_array();
        let group = group.as_array();
        let kernel = &*pipeline.kernel;

        trace!(
            queue = %queue.label,
            invocations,
            groups = total_groups,
            workers,
            "host dispatch"
        );

        let next = AtomicU64::new(0);
        let worker = || {
            catch_unwind(AssertUnwindSafe(|| loop {
                let g = next.fetch_add(1, Ordering::Relaxed);
                if g >= total_groups {
                    break;
                }
                let id = [
                    g % counts[0],
                    (g / counts[0]) % counts[1],
                    g / (counts[0] * counts[1]),
                ];
                run_group(kernel, &args, grid, group, id);
            }))
            .map_err(panic_message)
        };

        let outcome = if workers == 1 {
            worker()
        } else {
            std::thread::scope(|s| {
                let handles: Vec<_> = (0..workers).map(|_| s.spawn(&worker)).collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|p| Err(panic_message(p))))
                    .fold(Ok(()), |acc, r| acc.and(r))
            })
        };

        outcome.map_err(|msg| {
            DeviceError::Execution(format!(
                "kernel '{}' panicked: {}",
                pipeline.entry_point, msg
            ))
        })?;
        queue.submitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "@compute fn double() {} @compute fn declared_only() {}";

    fn device(workers: usize) -> HostDevice {
        let config = Config::builder()
            .worker_threads(workers)
            .build()
            .unwrap();
        let device = HostDevice::new(&config).unwrap();
        device.register_kernel("double", |inv, args| {
            let i = inv.position[0] as usize;
            args.store(0, i, args.load::<u32>(0, i) * 2);
        });
        device
    }

    fn run(
        device: &HostDevice,
        entry: &str,
        mem: &mut HostMemory,
        grid: [u64; 3],
    ) -> DeviceResult<()> {
        let module = device.compile_module(SOURCE)?;
        let pipeline = device.build_pipeline(&module, entry)?;
        let mut queue = device.create_queue(&pipeline)?;
        let group = device.group_limits(&pipeline).thread_group();
        let mut bindings = Bindings::new(vec![mem], vec![0]);
        let grid = GridSize {
            width: grid[0],
            height: grid[1],
            depth: grid[2],
        };
        device.dispatch(&mut queue, &pipeline, &mut bindings, grid, group)?;
        assert_eq!(queue.submitted(), 1);
        Ok(())
    }

    fn fill(mem: &mut HostMemory, n: u32) {
        let words: &mut [u32] = bytemuck::cast_slice_mut(mem.as_bytes_mut());
        for (i, w) in words.iter_mut().enumerate().take(n as usize) {
            *w = i as u32;
        }
    }

    #[test]
    fn test_pipeline_failures() {
        let device = device(1);
        let module = device.compile_module(SOURCE).unwrap();

        assert_eq!(
            device.build_pipeline(&module, "missing").unwrap_err(),
            DeviceError::EntryPointNotFound("missing".to_string())
        );
        assert!(matches!(
            device.build_pipeline(&module, "declared_only").unwrap_err(),
            DeviceError::PipelineBuild(_)
        ));
        assert!(matches!(
            device.compile_module("not a kernel").unwrap_err(),
            DeviceError::ModuleBuild(_)
        ));
    }

    #[test]
    fn test_allocation_is_zeroed_and_tracked() {
        let device = device(1);
        let mem = device.allocate(13).unwrap();
        assert_eq!(mem.len(), 13);
        assert!(mem.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(mem.as_bytes().as_ptr() as usize % 8, 0);
        assert_eq!(device.live_bytes(), 13);

        drop(mem);
        assert_eq!(device.live_bytes(), 0);
    }

    #[test]
    fn test_grid_is_clipped() {
        for workers in [1, 4] {
            let device = device(workers);
            let mut mem = device.allocate(1000 * 4).unwrap();
            fill(&mut mem, 1000);

            // 700 is not a multiple of the 32-wide group
            run(&device, "double", &mut mem, [700, 1, 1]).unwrap();

            let words: &[u32] = bytemuck::cast_slice(mem.as_bytes());
            for (i, &w) in words.iter().enumerate() {
                let expected = if i < 700 { i as u32 * 2 } else { i as u32 };
                assert_eq!(w, expected, "index {} with {} workers", i, workers);
            }
        }
    }

    #[test]
    fn test_out_of_range_access_is_ignored() {
        let device = device(2);
        let mut mem = device.allocate(10 * 4).unwrap();
        fill(&mut mem, 10);

        run(&device, "double", &mut mem, [64, 1, 1]).unwrap();

        let words: &[u32] = bytemuck::cast_slice(mem.as_bytes());
        assert_eq!(words[9], 18);
    }

    #[test]
    fn test_kernel_panic_is_reported() {
        let device = device(3);
        device.register_kernel("double", |inv, _| {
            if inv.position[0] == 5 {
                panic!("boom at 5");
            }
        });
        let mut mem = device.allocate(16).unwrap();

        let err = run(&device, "double", &mut mem, [100, 1, 1]).unwrap_err();
        match err {
            DeviceError::Execution(msg) => assert!(msg.contains("boom at 5"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invocation_linear_index() {
        let inv = Invocation {
            position: [2, 1, 1],
            group: [0, 0, 0],
            thread: [2, 1, 1],
            grid: [4, 3, 2],
        };
        assert_eq!(inv.linear_index(), 2 + 4 + 12);
    }
}
