//! Device-capability interface.
//!
//! The runtime never talks to a driver directly. Everything it needs from
//! hardware (compiling modules, building pipelines, allocating shared
//! memory, encoding and waiting on work) goes through [`Device`].

pub mod host;
pub mod source;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use host::{HostArgs, HostDevice, Invocation};

#[cfg(feature = "gpu")]
pub use gpu::GpuDevice;

use crate::dispatch::{GridSize, GroupLimits, ThreadGroupSize};

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Failures reported by a backend, tagged with the stage that failed.
///
/// Every variant carries the backend's own diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("{0}")]
    ModuleBuild(String),

    #[error("{0}")]
    EntryPointNotFound(String),

    #[error("{0}")]
    PipelineBuild(String),

    #[error("{0}")]
    QueueSetup(String),

    #[error("{0}")]
    Allocation(String),

    #[error("command buffer setup failed: {0}")]
    CommandBuffer(String),

    #[error("encoder setup failed: {0}")]
    Encoder(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

/// A block of memory visible to both the host and the device.
///
/// `as_bytes` must return exactly `len()` bytes starting at an address
/// aligned to at least 8 bytes, and the block must never move or resize
/// while it is alive.
pub trait DeviceMemory: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_bytes(&self) -> &[u8];

    fn as_bytes_mut(&mut self) -> &mut [u8];
}

/// Hardware primitives consumed by the runtime.
pub trait Device: Send + Sync + 'static {
    /// A compiled module holding one or more entry points.
    type Module;
    /// An executable pipeline for a single entry point.
    type Pipeline: Send + Sync + 'static;
    /// Work-submission channel bound to one pipeline.
    type Queue: Send + 'static;
    type Memory: DeviceMemory;

    /// Human-readable device name for logs.
    fn name(&self) -> String;

    fn compile_module(&self, source: &str) -> DeviceResult<Self::Module>;

    /// Resolve `entry_point` in `module` and build a pipeline for it.
    fn build_pipeline(&self, module: &Self::Module, entry_point: &str)
        -> DeviceResult<Self::Pipeline>;

    /// Threading limits of a built pipeline.
    fn group_limits(&self, pipeline: &Self::Pipeline) -> GroupLimits;

    fn entry_point_name(&self, pipeline: &Self::Pipeline) -> String;

    fn create_queue(&self, pipeline: &Self::Pipeline) -> DeviceResult<Self::Queue>;

    /// Allocate `len` zeroed bytes of host-and-device-shared memory.
    fn allocate(&self, len: usize) -> DeviceResult<Self::Memory>;

    /// Encode one dispatch, submit it, and block until it completes.
    ///
    /// The grid need not be a multiple of the group size.
    fn dispatch(
        &self,
        queue: &mut Self::Queue,
        pipeline: &Self::Pipeline,
        bindings: &mut Bindings<'_, Self::Memory>,
        grid: GridSize,
        group: ThreadGroupSize,
    ) -> DeviceResult<()>;
}

/// Buffers bound to one dispatch, in kernel argument order.
///
/// A block bound at several argument positions appears once in
/// [`blocks_mut`](Bindings::blocks_mut); `slot` maps an argument index to
/// its block.
pub struct Bindings<'a, M> {
    blocks: Vec<&'a mut M>,
    slots: Vec<usize>,
}

impl<'a, M> Bindings<'a, M> {
    pub(crate) fn new(blocks: Vec<&'a mut M>, slots: Vec<usize>) -> Self {
        debug_assert!(slots.iter().all(|&s| s < blocks.len()));
        Self { blocks, slots }
    }

    /// Number of kernel arguments.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index into the distinct blocks for argument `index`.
    pub fn slot(&self, index: usize) -> usize {
        self.slots[index]
    }

    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// The block bound at argument `index`.
    pub fn argument(&self, index: usize) -> &M {
        &*self.blocks[self.slots[index]]
    }

    /// Number of distinct blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &M> + '_ {
        self.blocks.iter().map(|b| &**b)
    }

    pub fn blocks_mut(&mut self) -> Box<dyn Iterator<Item = &mut M> + '_> {
        Box::new(self.blocks.iter_mut().map(|b| &mut **b))
    }
}

impl<M> std::fmt::Debug for Bindings<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("blocks", &self.blocks.len())
            .field("slots", &self.slots)
            .finish()
    }
}
