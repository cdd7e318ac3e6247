//! The entry point: one device context, and the buffers and kernels made on it.

use std::fmt;
use std::path::Path;
use std::rc::Rc;

use bytemuck::Pod;

use crate::buffer::Buffer;
use crate::config::RuntimeConfig;
use crate::device::{DeviceContext, DeviceProps};
use crate::diagnostics::{DiagnosticSink, NullSink};
use crate::driver::Driver;
use crate::kernel::{Kernel, KernelSource};
use crate::program::{self, CompiledKernels, EntryPoints};
use crate::sim::SimDriver;
use crate::types::Signature;
use crate::ClResult;

/// A selected device with its context and queue.
///
/// Cloning is cheap; clones share the context. The context is torn down when
/// the last runtime, buffer and kernel referring to it are gone.
pub struct Runtime<D: Driver> {
    ctx: Rc<DeviceContext<D>>,
}

impl<D: Driver> Clone for Runtime<D> {
    fn clone(&self) -> Self {
        Self {
            ctx: Rc::clone(&self.ctx),
        }
    }
}

impl<D: Driver> fmt::Debug for Runtime<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runtime").field(&self.ctx).finish()
    }
}

impl<D: Driver> Runtime<D> {
    /// Select a device through `driver` according to `config`. Fails if no
    /// platform, no device of the requested kind, or no usable device exists.
    pub fn acquire(
        driver: D,
        config: RuntimeConfig,
        sink: impl DiagnosticSink + 'static,
    ) -> ClResult<Self> {
        let ctx = DeviceContext::acquire(driver, config, Box::new(sink))?;
        Ok(Self { ctx: Rc::new(ctx) })
    }

    pub fn context(&self) -> &Rc<DeviceContext<D>> {
        &self.ctx
    }

    pub fn props(&self) -> &DeviceProps {
        self.ctx.props()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.ctx.config()
    }

    /// `size` bytes of uninitialized device memory.
    pub fn create_buffer(&self, size: usize, name: impl Into<String>) -> ClResult<Buffer<D>> {
        Buffer::allocate(&self.ctx, size, name)
    }

    /// A buffer sized to `data` and initialized from it.
    pub fn create_buffer_from<T: Pod>(
        &self,
        data: &[T],
        name: impl Into<String>,
    ) -> ClResult<Buffer<D>> {
        Buffer::from_slice(&self.ctx, data, name)
    }

    /// A kernel whose source is `file` under the configured kernel
    /// directory. Nothing is read or built until the first run.
    pub fn create_kernel(
        &self,
        file: impl AsRef<Path>,
        entry: &str,
        signature: impl Into<Signature>,
    ) -> Kernel<D> {
        let path = self.ctx.config().kernel_dir.join(file);
        Kernel::new(
            Rc::clone(&self.ctx),
            entry,
            KernelSource::File(path),
            signature.into(),
        )
    }

    pub fn create_kernel_from_source(
        &self,
        source: impl Into<String>,
        entry: &str,
        signature: impl Into<Signature>,
    ) -> Kernel<D> {
        Kernel::new(
            Rc::clone(&self.ctx),
            entry,
            KernelSource::Inline(source.into()),
            signature.into(),
        )
    }

    /// Build `source` and resolve `entries` with the configured options.
    pub fn compile(
        &self,
        source: &str,
        entries: impl Into<EntryPoints>,
    ) -> ClResult<CompiledKernels<D::Kernel>> {
        program::compile(&self.ctx, source, entries, None)
    }

    /// Like [`compile`](Self::compile) with `-I include_dir` instead of the
    /// configured include directory.
    pub fn compile_with_includes(
        &self,
        source: &str,
        entries: impl Into<EntryPoints>,
        include_dir: &Path,
    ) -> ClResult<CompiledKernels<D::Kernel>> {
        program::compile(&self.ctx, source, entries, Some(include_dir))
    }

    /// Block until the queue is drained.
    pub fn finish(&self) -> ClResult<()> {
        self.ctx.finish()
    }
}

impl Runtime<SimDriver> {
    /// A runtime on the simulated device with default configuration and no
    /// diagnostics.
    pub fn simulated(driver: SimDriver) -> ClResult<Self> {
        Self::acquire(driver, RuntimeConfig::default(), NullSink)
    }
}

#[cfg(feature = "opencl")]
impl Runtime<crate::opencl::OpenClDriver> {
    /// A runtime on the system's OpenCL implementation, logging through the
    /// `log` facade.
    pub fn opencl(config: RuntimeConfig) -> ClResult<Self> {
        Self::acquire(
            crate::opencl::OpenClDriver::new(),
            config,
            crate::diagnostics::LogSink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use crate::{ArgType, ArgValue, ErrorKind};
    use std::io::Write;

    #[test]
    fn test_kernel_file_resolved_under_kernel_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("noop.cl")).unwrap();
        writeln!(f, "__kernel void noop(int n) {{}}").unwrap();

        let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
        let cfg = RuntimeConfig::default().with_kernel_dir(dir.path());
        let rt = Runtime::acquire(driver.clone(), cfg, NullSink).unwrap();
        let mut k = rt.create_kernel("noop.cl", "noop", &[ArgType::Int]);
        k.run_with(&[1], None, [ArgValue::from(1i32)]).unwrap();
        assert_eq!(driver.stats().enqueues, 1);
        assert!(driver.builds()[0].source.contains("noop"));
    }

    #[test]
    fn test_missing_kernel_file() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
        let cfg = RuntimeConfig::default().with_kernel_dir(dir.path());
        let rt = Runtime::acquire(driver.clone(), cfg, NullSink).unwrap();
        let mut k = rt.create_kernel("absent.cl", "absent", &[ArgType::Int]);
        let err = k.run(&[1], None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(driver.stats().builds, 0);
    }

    #[test]
    fn test_context_outlives_runtime() {
        let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
        let rt = Runtime::simulated(driver.clone()).unwrap();
        let buf = rt.create_buffer_from(&[5u16, 6], "kept").unwrap();
        drop(rt);
        assert_eq!(buf.read::<u16>().unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_compile_with_includes_overrides_config() {
        let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
        let cfg = RuntimeConfig::default().with_include_dir("configured");
        let rt = Runtime::acquire(driver.clone(), cfg, NullSink).unwrap();
        rt.compile_with_includes("kernel void k() {}", "k", Path::new("override"))
            .map(|_| ())
            .unwrap();
        assert!(driver.last_build_options().unwrap().starts_with("-I override"));
    }
}
