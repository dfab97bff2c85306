use crate::cache::CacheError;
use crate::device::DeviceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing kernel source")]
    MissingSource,

    #[error("missing kernel entry point")]
    MissingEntryPoint,

    #[error("invalid buffer dimensions: {0}")]
    InvalidDimensions(String),

    #[error("kernel compilation failed: {0}")]
    CompileFailed(String),

    #[error("entry point '{0}' not found")]
    EntryPointNotFound(String),

    #[error("pipeline setup failed: {0}")]
    PipelineFailed(String),

    #[error("command queue setup failed: {0}")]
    QueueSetupFailed(String),

    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("resource registration failed: {0}")]
    CacheFailed(#[source] CacheError),

    #[error("kernel {0} not found")]
    FunctionNotFound(i64),

    #[error("buffer {position} of {total} not found (handle {handle})")]
    BufferNotFound {
        position: usize,
        total: usize,
        handle: i64,
    },

    #[error("dispatch failed: {0}")]
    DispatchFailed(#[source] DeviceError),

    #[error("no usable device: {0}")]
    NoDevice(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something unusable.
    InvalidArgument,
    /// A handle did not resolve.
    NotFound,
    /// The device rejected the request; carries its diagnostic.
    BackendFailure,
    /// A valid resource could not be registered.
    CacheFailure,
    /// The runtime was configured inconsistently.
    Config,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_dimensions<S: Into<String>>(msg: S) -> Self {
        Error::InvalidDimensions(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingSource | Error::MissingEntryPoint | Error::InvalidDimensions(_) => {
                ErrorKind::InvalidArgument
            }
            Error::FunctionNotFound(_) | Error::BufferNotFound { .. } => ErrorKind::NotFound,
            Error::CompileFailed(_)
            | Error::EntryPointNotFound(_)
            | Error::PipelineFailed(_)
            | Error::QueueSetupFailed(_)
            | Error::AllocationFailed(_)
            | Error::DispatchFailed(_)
            | Error::NoDevice(_) => ErrorKind::BackendFailure,
            Error::CacheFailed(_) => ErrorKind::CacheFailure,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::ModuleBuild(msg) => Error::CompileFailed(msg),
            DeviceError::EntryPointNotFound(name) => Error::EntryPointNotFound(name),
            DeviceError::PipelineBuild(msg) => Error::PipelineFailed(msg),
            DeviceError::QueueSetup(msg) => Error::QueueSetupFailed(msg),
            DeviceError::Allocation(msg) => Error::AllocationFailed(msg),
            other => Error::DispatchFailed(other),
        }
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::CacheFailed(err)
    }
}
