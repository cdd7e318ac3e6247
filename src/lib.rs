//! Host-side runtime for dispatching OpenCL kernels onto a single device.
//!
//! The crate covers four pieces:
//!
//! - [`device`]: platform/device enumeration, vendor + capacity ranking, and
//!   creation of the one context and command queue everything else uses.
//! - [`buffer`]: device memory with blocking host/device transfers and an
//!   explicit release.
//! - [`program`]: building program source into kernel handles, with
//!   version-gated build flags and build-log capture.
//! - [`kernel`]: a kernel object that recompiles only when its preprocessor
//!   defines change and rebinds only the arguments whose values changed.
//!
//! All device calls go through the [`driver::Driver`] trait. The real OpenCL
//! implementation lives behind the `opencl` feature; [`sim::SimDriver`] is a
//! host-memory device used by the tests and benches.
//!
//! ```rust,no_run
//! # #[cfg(feature = "opencl")]
//! # fn example() -> clrun::ClResult<()> {
//! use clrun::{ArgType, ArgValue, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::opencl(RuntimeConfig::from_env())?;
//! let ones = rt.create_buffer_from(&[1i32, 1, 1], "ones")?;
//! let twos = rt.create_buffer_from(&[2i32, 2, 2], "twos")?;
//! let out = rt.create_buffer(3 * 4, "out")?;
//!
//! let mut add = rt.create_kernel(
//!     "add.cl",
//!     "add",
//!     &[ArgType::Mem, ArgType::Mem, ArgType::Mem, ArgType::Int],
//! );
//! add.run_with(
//!     &[3],
//!     None,
//!     [
//!         ArgValue::from(&ones),
//!         ArgValue::from(&twos),
//!         ArgValue::from(&out),
//!         ArgValue::from(3i32),
//!     ],
//! )?;
//! assert_eq!(out.read::<i32>()?, vec![3, 3, 3]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod driver;
pub mod kernel;
pub mod program;
pub mod runtime;
pub mod sim;
pub mod types;

#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(test)]
mod validation;

pub use buffer::Buffer;
pub use config::RuntimeConfig;
pub use device::{DeviceContext, DeviceKind, DeviceProps};
pub use diagnostics::{DiagnosticSink, Event, LogSink, NullSink, RecordingSink};
pub use kernel::{Kernel, KernelState, KernelStats};
pub use program::{CompiledKernels, EntryPoints};
pub use runtime::Runtime;
pub use types::{ArgType, ArgValue, DefineValue, Param, Scalar, Signature};

use std::path::PathBuf;

/// Error types for clrun operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClError {
    /// The driver reported no platform at all.
    #[error("no OpenCL platform found")]
    NoPlatformFound,
    /// The first platform has no device of the requested kind.
    #[error("no OpenCL devices of kind {kind} found")]
    NoDeviceOfRequestedKind { kind: DeviceKind },
    /// Every ranked candidate failed context or queue creation. Carries the
    /// last failure.
    #[error("could not create a context on device {device}: {reason}")]
    ContextCreationFailed { device: String, reason: String },
    /// The device rejected an allocation.
    #[error("could not allocate buffer {name} ({size} bytes): {reason}")]
    AllocationFailed {
        name: String,
        size: usize,
        reason: String,
    },
    /// Program build failed. `log` is the driver's build log when it could be
    /// retrieved.
    #[error("program build failed: {reason}{}", .log.as_deref().map(|l| format!("\n{l}")).unwrap_or_default())]
    BuildFailed { reason: String, log: Option<String> },
    /// The program built but has no entry point of this name.
    #[error("kernel {entry} not found in program: {reason}")]
    KernelCreationFailed { entry: String, reason: String },
    /// A build returned no handle for the kernel being run.
    #[error("kernel {kernel} is not compiled, aborting")]
    KernelNotCompiled { kernel: String },
    /// A declared define was never given a value.
    #[error("define {define} of kernel {kernel} was never set")]
    MissingDefine { kernel: String, define: String },
    /// Kernel source file could not be read.
    #[error("could not read kernel source {}: {source}", .path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Caller contract violation: released buffer, wrong argument type,
    /// out-of-range transfer, bad work size.
    #[error("usage error: {0}")]
    Usage(String),
    /// The driver rejected a transfer, argument bind or dispatch.
    #[error("{op} failed: {reason}")]
    Device { op: &'static str, reason: String },
}

/// Coarse classification of a [`ClError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PlatformUnavailable,
    DeviceUnavailable,
    AllocationFailed,
    BuildFailed,
    MissingDefine,
    UsageError,
    DeviceFailure,
    SourceUnavailable,
}

impl ClError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoPlatformFound => ErrorKind::PlatformUnavailable,
            Self::NoDeviceOfRequestedKind { .. } | Self::ContextCreationFailed { .. } => {
                ErrorKind::DeviceUnavailable
            }
            Self::AllocationFailed { .. } => ErrorKind::AllocationFailed,
            Self::BuildFailed { .. }
            | Self::KernelCreationFailed { .. }
            | Self::KernelNotCompiled { .. } => ErrorKind::BuildFailed,
            Self::MissingDefine { .. } => ErrorKind::MissingDefine,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::Usage(_) => ErrorKind::UsageError,
            Self::Device { .. } => ErrorKind::DeviceFailure,
        }
    }

    /// Whether this error came out of device acquisition. These are not
    /// recoverable: no runtime exists to retry against.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PlatformUnavailable | ErrorKind::DeviceUnavailable
        )
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub(crate) fn device(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Device {
            op,
            reason: reason.to_string(),
        }
    }
}

pub type ClResult<T> = Result<T, ClError>;
