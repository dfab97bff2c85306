//! wgpu backend.
//!
//! Kernels are WGSL compute shaders. The runtime's thread-group shape is
//! fixed per device, so it is prepended to every module as
//! `GROUP_SIZE_X`, `GROUP_SIZE_Y` and `GROUP_SIZE_Z` constants that
//! `@workgroup_size` can refer to.
//!
//! wgpu has no non-uniform dispatch: the group count is rounded up on
//! every axis. The dispatched grid is bound as the `GRID_SIZE` uniform in
//! bind group 1 and kernels skip invocations outside it with
//! `all(id < GRID_SIZE)`. Storage arguments live in bind group 0, one per
//! declared `var<storage>`, in binding order.
//!
//! Each buffer keeps a host copy. Host copies of the bound buffers are
//! uploaded before a dispatch and read back once it completes.

use super::source::{self, StorageBinding, GRID_GROUP};
use super::{Bindings, Device, DeviceError, DeviceMemory, DeviceResult};
use crate::config::{Config, PowerPreference};
use crate::dispatch::{GridSize, GroupLimits, ThreadGroupSize};
use crate::error::{Error, Result};
use futures::executor::block_on;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const WORD: usize = std::mem::size_of::<u64>();
const GRID_UNIFORM_BYTES: u64 = 16;

pub struct GpuModule {
    module: wgpu::ShaderModule,
    entry_points: Vec<String>,
    storage: Vec<StorageBinding>,
}

impl fmt::Debug for GpuModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuModule")
            .field("entry_points", &self.entry_points)
            .field("storage", &self.storage)
            .finish()
    }
}

pub struct GpuPipeline {
    pipeline: wgpu::ComputePipeline,
    storage_layout: wgpu::BindGroupLayout,
    grid_layout: wgpu::BindGroupLayout,
    storage: Vec<StorageBinding>,
    entry_point: String,
}

impl fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuPipeline")
            .field("entry_point", &self.entry_point)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Per-kernel submission state, including the kernel's `GRID_SIZE` uniform.
pub struct GpuQueue {
    label: String,
    submitted: u64,
    grid: wgpu::Buffer,
    grid_group: wgpu::BindGroup,
}

impl fmt::Debug for GpuQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuQueue")
            .field("label", &self.label)
            .field("submitted", &self.submitted)
            .finish()
    }
}

impl GpuQueue {
    pub fn submitted(&self) -> u64 {
        self.submitted
    }
}

/// A storage buffer with its host copy and readback staging buffer.
pub struct GpuMemory {
    shadow: Vec<u64>,
    len: usize,
    storage: wgpu::Buffer,
    staging: wgpu::Buffer,
}

impl GpuMemory {
    fn padded_len(&self) -> u64 {
        (self.shadow.len() * WORD) as u64
    }
}

impl DeviceMemory for GpuMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.shadow)[..self.len]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.shadow)[..self.len]
    }
}

impl fmt::Debug for GpuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMemory").field("len", &self.len).finish()
    }
}

/// A wgpu adapter and device.
pub struct GpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    device_limits: wgpu::Limits,
    limits: GroupLimits,
    max_allocation: Option<usize>,
    label: String,
}

impl GpuDevice {
    /// Open the preferred adapter, blocking until it is ready.
    pub fn new(config: &Config) -> Result<Self> {
        block_on(Self::new_async(config))
    }

    pub async fn new_async(config: &Config) -> Result<Self> {
        config.validate()?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power_preference = match config.power_preference {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
            .ok_or_else(|| Error::NoDevice("no compatible adapter found".to_string()))?;

        let adapter_info = adapter.get_info();
        let device_limits = adapter.limits();
        let label = config.label("gpu");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(label.as_str()),
                    required_features: wgpu::Features::empty(),
                    required_limits: device_limits.clone(),
                },
                None,
            )
            .await
            .map_err(|e| Error::NoDevice(format!("failed to request device: {}", e)))?;

        device.on_uncaptured_error(Box::new(|error| {
            warn!("uncaptured GPU error: {}", error);
        }));

        let mut max_group_threads = device_limits.max_compute_invocations_per_workgroup;
        if let Some(cap) = config.max_group_threads {
            max_group_threads = max_group_threads.min(cap);
        }
        let limits = GroupLimits {
            warp_width: config
                .warp_width
                .min(device_limits.max_compute_workgroup_size_x),
            max_group_threads,
        };

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            group = ?limits.thread_group().as_array(),
            "gpu device ready"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            device_limits,
            limits,
            max_allocation: config.max_allocation_bytes,
            label,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// WGSL declarations prepended to every module.
    pub fn prelude(&self) -> String {
        source::wgsl_prelude(self.limits.thread_group())
    }

    fn scoped<T>(
        &self,
        filter: wgpu::ErrorFilter,
        f: impl FnOnce() -> T,
    ) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f();
        let error = block_on(self.device.pop_error_scope());
        (value, error)
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("label", &self.label)
            .field("adapter", &self.adapter_info.name)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Device for GpuDevice {
    type Module = GpuModule;
    type Pipeline = GpuPipeline;
    type Queue = GpuQueue;
    type Memory = GpuMemory;

    fn name(&self) -> String {
        format!("{} ({:?})", self.adapter_info.name, self.adapter_info.backend)
    }

    fn compile_module(&self, source: &str) -> DeviceResult<GpuModule> {
        let entry_points = source::entry_points(source).map_err(DeviceError::ModuleBuild)?;
        let storage = source::storage_bindings(source).map_err(DeviceError::ModuleBuild)?;
        let code = format!("{}{}", self.prelude(), source);

        let (module, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(self.label.as_str()),
                    source: wgpu::ShaderSource::Wgsl(code.into()),
                })
        });
        if let Some(err) = error {
            return Err(DeviceError::ModuleBuild(err.to_string()));
        }

        Ok(GpuModule {
            module,
            entry_points,
            storage,
        })
    }

    fn build_pipeline(
        &self,
        module: &GpuModule,
        entry_point: &str,
    ) -> DeviceResult<GpuPipeline> {
        if !module.entry_points.iter().any(|e| e == entry_point) {
            return Err(DeviceError::EntryPointNotFound(entry_point.to_string()));
        }

        let storage_entries: Vec<wgpu::BindGroupLayoutEntry> = module
            .storage
            .iter()
            .map(|b| wgpu::BindGroupLayoutEntry {
                binding: b.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: b.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let ((pipeline, storage_layout, grid_layout), error) =
            self.scoped(wgpu::ErrorFilter::Validation, || {
                let storage_layout =
                    self.device
                        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                            label: Some(entry_point),
                            entries: &storage_entries,
                        });
                let grid_layout =
                    self.device
                        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                            label: Some("veda-grid-size"),
                            entries: &[wgpu::BindGroupLayoutEntry {
                                binding: 0,
                                visibility: wgpu::ShaderStages::COMPUTE,
                                ty: wgpu::BindingType::Buffer {
                                    ty: wgpu::BufferBindingType::Uniform,
                                    has_dynamic_offset: false,
                                    min_binding_size: None,
                                },
                                count: None,
                            }],
                        });
                let layout = self
                    .device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some(entry_point),
                        bind_group_layouts: &[&storage_layout, &grid_layout],
                        push_constant_ranges: &[],
                    });
                let pipeline =
                    self.device
                        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                            label: Some(entry_point),
                            layout: Some(&layout),
                            module: &module.module,
                            entry_point,
                        });
                (pipeline, storage_layout, grid_layout)
            });
        if let Some(err) = error {
            return Err(DeviceError::PipelineBuild(err.to_string()));
        }

        Ok(GpuPipeline {
            pipeline,
            storage_layout,
            grid_layout,
            storage: module.storage.clone(),
            entry_point: entry_point.to_string(),
        })
    }

    fn group_limits(&self, _pipeline: &GpuPipeline) -> GroupLimits {
        self.limits
    }

    fn entry_point_name(&self, pipeline: &GpuPipeline) -> String {
        pipeline.entry_point.clone()
    }

    fn create_queue(&self, pipeline: &GpuPipeline) -> DeviceResult<GpuQueue> {
        let label = format!("{}-{}", self.label, pipeline.entry_point);

        let ((grid, grid_group), error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let grid = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label.as_str()),
                size: GRID_UNIFORM_BYTES,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let grid_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label.as_str()),
                layout: &pipeline.grid_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: grid.as_entire_binding(),
                }],
            });
            (grid, grid_group)
        });
        if let Some(err) = error {
            return Err(DeviceError::QueueSetup(err.to_string()));
        }

        Ok(GpuQueue {
            label,
            submitted: 0,
            grid,
            grid_group,
        })
    }

    fn allocate(&self, len: usize) -> DeviceResult<GpuMemory> {
        let max = self
            .max_allocation
            .unwrap_or(usize::MAX)
            .min(self.device_limits.max_storage_buffer_binding_size as usize);
        if len == 0 || len > max {
            return Err(DeviceError::Allocation(format!(
                "requested {} bytes, device allows 1 to {} bytes",
                len, max
            )));
        }

        let words = len.div_ceil(WORD);
        let padded = (words * WORD) as u64;

        let ((storage, staging), error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, || {
            let storage = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("veda-grid-storage"),
                size: padded,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("veda-grid-staging"),
                size: padded,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (storage, staging)
        });
        if let Some(err) = error {
            return Err(DeviceError::Allocation(format!("{} bytes: {}", len, err)));
        }

        Ok(GpuMemory {
            shadow: vec![0; words],
            len,
            storage,
            staging,
        })
    }

    fn dispatch(
        &self,
        queue: &mut GpuQueue,
        pipeline: &GpuPipeline,
        bindings: &mut Bindings<'_, GpuMemory>,
        grid: GridSize,
        group: ThreadGroupSize,
    ) -> DeviceResult<()> {
        // Command buffer
        let counts = group.groups_for(grid);
        let max_groups = self.device_limits.max_compute_workgroups_per_dimension as u64;
        if counts.iter().any(|&c| c > max_groups) {
            return Err(DeviceError::CommandBuffer(format!(
                "grid {:?} needs {:?} groups, at most {} per axis",
                grid.as_array(),
                counts,
                max_groups
            )));
        }
        let grid_size = grid.to_u32x4().ok_or_else(|| {
            DeviceError::CommandBuffer(format!(
                "grid {:?} exceeds {} items per axis",
                grid.as_array(),
                u32::MAX
            ))
        })?;
        let max_bindings = self.device_limits.max_storage_buffers_per_shader_stage as usize;
        if bindings.len() > max_bindings {
            return Err(DeviceError::CommandBuffer(format!(
                "{} buffers bound, at most {} supported",
                bindings.len(),
                max_bindings
            )));
        }

        // Encoder
        if bindings.len() != pipeline.storage.len() {
            return Err(DeviceError::Encoder(format!(
                "kernel '{}' declares {} storage buffers, {} bound",
                pipeline.entry_point,
                pipeline.storage.len(),
                bindings.len()
            )));
        }

        for block in bindings.blocks() {
            self.queue
                .write_buffer(&block.storage, 0, bytemuck::cast_slice(&block.shadow));
        }
        self.queue
            .write_buffer(&queue.grid, 0, bytemuck::cast_slice(&grid_size));

        let (commands, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let entries: Vec<wgpu::BindGroupEntry<'_>> = pipeline
                .storage
                .iter()
                .enumerate()
                .map(|(i, b)| wgpu::BindGroupEntry {
                    binding: b.binding,
                    resource: bindings.argument(i).storage.as_entire_binding(),
                })
                .collect();
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(queue.label.as_str()),
                layout: &pipeline.storage_layout,
                entries: &entries,
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(queue.label.as_str()),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(queue.label.as_str()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_bind_group(GRID_GROUP, &queue.grid_group, &[]);
                pass.dispatch_workgroups(counts[0] as u32, counts[1] as u32, counts[2] as u32);
            }
            for block in bindings.blocks() {
                encoder.copy_buffer_to_buffer(
                    &block.storage,
                    0,
                    &block.staging,
                    0,
                    block.padded_len(),
                );
            }
            encoder.finish()
        });
        if let Some(err) = error {
            return Err(DeviceError::Encoder(err.to_string()));
        }

        // Submission
        trace!(queue = %queue.label, groups = ?counts, "gpu dispatch");
        self.queue.submit(Some(commands));

        let receivers: Vec<_> = bindings
            .blocks()
            .map(|block| {
                let (sender, receiver) = futures::channel::oneshot::channel();
                block
                    .staging
                    .slice(..)
                    .map_async(wgpu::MapMode::Read, move |result| {
                        let _ = sender.send(result);
                    });
                receiver
            })
            .collect();

        let _ = self.device.poll(wgpu::Maintain::Wait);

        for (block, receiver) in bindings.blocks_mut().zip(receivers) {
            block_on(receiver)
                .map_err(|_| DeviceError::Execution("readback channel closed".to_string()))?
                .map_err(|e| DeviceError::Execution(e.to_string()))?;

            {
                let mapped = block.staging.slice(..).get_mapped_range();
                bytemuck::cast_slice_mut::<u64, u8>(&mut block.shadow).copy_from_slice(&mapped);
            }
            block.staging.unmap();
        }

        queue.submitted += 1;
        debug!(queue = %queue.label, submitted = queue.submitted, "gpu dispatch complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOUBLE: &str = r#"
        @group(0) @binding(0) var<storage, read_write> data: array<u32>;

        @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
        fn double(@builtin(global_invocation_id) id: vec3<u32>) {
            if (all(id < GRID_SIZE)) {
                data[id.x] = data[id.x] * 2u;
            }
        }
    "#;

    fn device() -> Option<GpuDevice> {
        match GpuDevice::new(&Config::default()) {
            Ok(device) => Some(device),
            Err(err) => {
                eprintln!("skipping GPU test: {}", err);
                None
            }
        }
    }

    // Runs every invocation of 8-deep groups against a 1-D grid; a missing
    // guard would double each element several times.
    #[test]
    fn test_gpu_double() {
        let Some(device) = device() else { return };

        let module = device.compile_module(DOUBLE).unwrap();
        assert!(matches!(
            device.build_pipeline(&module, "missing"),
            Err(DeviceError::EntryPointNotFound(_))
        ));

        let pipeline = device.build_pipeline(&module, "double").unwrap();
        let mut queue = device.create_queue(&pipeline).unwrap();
        let mut mem = device.allocate(100 * 4).unwrap();
        {
            let words: &mut [u32] = bytemuck::cast_slice_mut(mem.as_bytes_mut());
            for (i, w) in words.iter_mut().enumerate() {
                *w = i as u32;
            }
        }

        let grid = GridSize {
            width: 100,
            height: 1,
            depth: 1,
        };
        let group = device.group_limits(&pipeline).thread_group();
        let mut bindings = Bindings::new(vec![&mut mem], vec![0]);
        device
            .dispatch(&mut queue, &pipeline, &mut bindings, grid, group)
            .unwrap();

        let words: &[u32] = bytemuck::cast_slice(mem.as_bytes());
        for (i, &w) in words.iter().enumerate() {
            assert_eq!(w, i as u32 * 2);
        }
        assert_eq!(queue.submitted(), 1);

        // Argument count must match the declared storage buffers
        let mut extra = device.allocate(16).unwrap();
        let mut bindings = Bindings::new(vec![&mut mem, &mut extra], vec![0, 1]);
        assert!(matches!(
            device.dispatch(&mut queue, &pipeline, &mut bindings, grid, group),
            Err(DeviceError::Encoder(_))
        ));
    }

    #[test]
    fn test_gpu_rejects_bad_wgsl() {
        let Some(device) = device() else { return };

        let err = device
            .compile_module("@compute @workgroup_size(1) fn broken() { let x: u32 = ; }")
            .unwrap_err();
        assert!(matches!(err, DeviceError::ModuleBuild(_)));
    }
}
