pub use crate::buffer::{Element, View1, View2, View3};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::device::{HostArgs, HostDevice, Invocation};
pub use crate::dispatch::Grid;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::handle::{BufferHandle, KernelHandle};
pub use crate::runtime::Runtime;

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};

#[cfg(feature = "gpu")]
pub use crate::device::GpuDevice;
