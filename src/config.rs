use crate::error::{Error, Result};
use std::time::Duration;

/// Adapter preference for the wgpu backend.
#[cfg(feature = "gpu")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Threads a device runs in lockstep along one axis, for backends
    /// that cannot ask the hardware.
    pub warp_width: u32,
    /// Upper bound on threads per group; backends clamp it to their own
    /// limit.
    pub max_group_threads: Option<u32>,
    /// Worker threads for the host backend.
    pub worker_threads: Option<usize>,
    pub max_allocation_bytes: Option<usize>,
    pub max_kernels: Option<usize>,
    pub max_buffers: Option<usize>,
    /// How long a dispatch waits for host views of its buffers to be
    /// released before failing.
    pub buffer_lock_timeout: Duration,

    #[cfg(feature = "telemetry")]
    pub enable_telemetry: bool,

    pub label_prefix: String,

    #[cfg(feature = "gpu")]
    pub power_preference: PowerPreference,

    #[cfg(feature = "gpu")]
    pub force_fallback_adapter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            warp_width: 32,
            max_group_threads: None,
            worker_threads: None,
            max_allocation_bytes: None,
            max_kernels: None,
            max_buffers: None,
            buffer_lock_timeout: Duration::from_secs(5),

            #[cfg(feature = "telemetry")]
            enable_telemetry: true,

            label_prefix: "veda-grid".to_string(),

            #[cfg(feature = "gpu")]
            power_preference: PowerPreference::default(),

            #[cfg(feature = "gpu")]
            force_fallback_adapter: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.warp_width == 0 {
            return Err(Error::config("warp_width must be > 0"));
        }

        if let Some(max) = self.max_group_threads {
            if max == 0 {
                return Err(Error::config("max_group_threads must be > 0"));
            }
            if self.warp_width > max {
                return Err(Error::config(format!(
                    "warp_width ({}) exceeds max_group_threads ({})",
                    self.warp_width, max
                )));
            }
        }

        if let Some(n) = self.worker_threads {
            if n == 0 {
                return Err(Error::config("worker_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("worker_threads too large (max 1024)"));
            }
        }

        if self.max_allocation_bytes == Some(0) {
            return Err(Error::config("max_allocation_bytes must be > 0"));
        }
        if self.max_kernels == Some(0) {
            return Err(Error::config("max_kernels must be > 0"));
        }
        if self.max_buffers == Some(0) {
            return Err(Error::config("max_buffers must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }

    pub(crate) fn label(&self, what: &str) -> String {
        format!("{}-{}", self.label_prefix, what)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn warp_width(mut self, width: u32) -> Self {
        self.config.warp_width = width;
        self
    }

    pub fn max_group_threads(mut self, threads: u32) -> Self {
        self.config.max_group_threads = Some(threads);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = Some(n);
        self
    }

    pub fn max_allocation_bytes(mut self, bytes: usize) -> Self {
        self.config.max_allocation_bytes = Some(bytes);
        self
    }

    pub fn max_kernels(mut self, n: usize) -> Self {
        self.config.max_kernels = Some(n);
        self
    }

    pub fn max_buffers(mut self, n: usize) -> Self {
        self.config.max_buffers = Some(n);
        self
    }

    pub fn buffer_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.buffer_lock_timeout = timeout;
        self
    }

    #[cfg(feature = "telemetry")]
    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn label_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.label_prefix = prefix.into();
        self
    }

    #[cfg(feature = "gpu")]
    pub fn power_preference(mut self, preference: PowerPreference) -> Self {
        self.config.power_preference = preference;
        self
    }

    #[cfg(feature = "gpu")]
    pub fn force_fallback_adapter(mut self, force: bool) -> Self {
        self.config.force_fallback_adapter = force;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
