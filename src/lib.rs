//! VEDA Grid - handle-based compute dispatch
//!
//! Compile small compute kernels, allocate buffers shared between host and
//! device, and dispatch kernels over a grid of up to three dimensions,
//! blocking until the device finishes.
//!
//! # Quick Start
//!
//! ```no_run
//! use veda_grid::prelude::*;
//!
//! const COPY: &str = r#"
//!     @group(0) @binding(0) var<storage, read> input: array<f32>;
//!     @group(0) @binding(1) var<storage, read_write> output: array<f32>;
//!
//!     @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
//!     fn copy(@builtin(global_invocation_id) id: vec3<u32>) {
//!         if (all(id < GRID_SIZE)) {
//!             output[id.x] = input[id.x];
//!         }
//!     }
//! "#;
//!
//! let rt = Runtime::host(Config::default()).unwrap();
//! rt.device().register_kernel("copy", |inv, args| {
//!     let i = inv.position[0] as usize;
//!     args.store(1, i, args.load::<f32>(0, i));
//! });
//!
//! let kernel = rt.compile_kernel(COPY, "copy").unwrap();
//! let (input, input_view) = rt.new_buffer_1d::<f32>(1024).unwrap();
//! let (output, output_view) = rt.new_buffer_1d::<f32>(1024).unwrap();
//!
//! for (i, v) in input_view.write().iter_mut().enumerate() {
//!     *v = i as f32;
//! }
//!
//! rt.dispatch(kernel, Grid::linear(1024), &[input, output]).unwrap();
//! assert_eq!(output_view.read()[10], 10.0);
//! ```
//!
//! # Features
//!
//! - **Typed Handles**: kernels and buffers are positive integer handles
//!   that cannot be mixed up
//! - **Shaped Buffers**: 1D, 2D and 3D views over one flat, zero-copy block
//! - **Thread-Group Policy**: one warp wide, as many warps deep as the
//!   device allows, independent of the grid
//! - **Host Backend**: runs kernels as Rust closures on worker threads
//! - **GPU Support**: wgpu backend (optional, `gpu` feature)
//! - **Telemetry**: dispatch counters and latency histogram (optional)

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod buffer;
pub mod cache;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod handle;
mod kernel;
pub mod prelude;
pub mod runtime;
pub mod telemetry;

// Re-export key types at crate root
pub use buffer::{BufferInfo, Element, Shape, View1, View2, View3};
pub use config::{Config, ConfigBuilder};
pub use device::{Device, DeviceError, HostDevice};
pub use dispatch::{Grid, GridSize, GroupLimits, ThreadGroupSize};
pub use error::{Error, ErrorKind, Result};
pub use handle::{BufferHandle, Handle, KernelHandle};
pub use runtime::Runtime;

#[cfg(feature = "gpu")]
pub use device::GpuDevice;
