//! The seam between the runtime and a concrete compute API.
//!
//! Every device call made by the selector, the buffers, the program compiler
//! and the kernels goes through [`Driver`]. Handles are associated types so
//! each backend keeps its own RAII wrappers: dropping a `Mem`, `Kernel`,
//! `Queue` or `Context` releases it.

use crate::types::Scalar;
use crate::ClResult;

/// Device class filter used when enumerating devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

impl DeviceClass {
    pub fn label(self) -> &'static str {
        match self {
            DeviceClass::Cpu => "CPU",
            DeviceClass::Gpu => "GPU",
            DeviceClass::Accelerator => "ACCELERATOR",
            DeviceClass::Other => "DEFAULT",
        }
    }
}

/// Raw device properties as reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    /// Full version string, e.g. `"OpenCL 1.2 CUDA"`.
    pub version: String,
    pub profile: String,
    pub platform: String,
    pub class: Option<DeviceClass>,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    pub max_mem_alloc_size: u64,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_constant_buffer_size: u64,
    /// Nanoseconds.
    pub profiling_timer_resolution: usize,
    pub max_compute_units: u32,
}

/// How the command queue is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreation {
    /// OpenCL 2.0 `clCreateCommandQueueWithProperties`.
    WithProperties,
    /// OpenCL 1.x `clCreateCommandQueue` with zero properties.
    Legacy,
}

/// A value handed to `clSetKernelArg`.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a, M> {
    Mem(&'a M),
    Scalar(&'a Scalar),
    /// `__local` scratch of this many bytes.
    Local(usize),
}

/// Failure of a program build, with the build log when the driver could
/// produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub reason: String,
    pub log: Option<String>,
}

pub trait Driver {
    type Platform: Clone;
    type Device: Clone;
    type Context;
    type Queue;
    type Mem;
    type Program;
    type Kernel;

    fn platforms(&self) -> ClResult<Vec<Self::Platform>>;

    /// Devices of `platform` whose class matches `filter`; `None` means all.
    /// An empty result is not an error.
    fn devices(
        &self,
        platform: &Self::Platform,
        filter: Option<DeviceClass>,
    ) -> ClResult<Vec<Self::Device>>;

    fn device_info(&self, device: &Self::Device) -> ClResult<DeviceInfo>;

    /// Whether the host library was built with OpenCL 2.0 support.
    fn runtime_supports_cl2(&self) -> bool;

    fn create_context(
        &self,
        platform: &Self::Platform,
        device: &Self::Device,
    ) -> ClResult<Self::Context>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        creation: QueueCreation,
        profiling: bool,
    ) -> ClResult<Self::Queue>;

    fn create_buffer(&self, context: &Self::Context, size: usize) -> ClResult<Self::Mem>;

    /// Blocking write of `data` at byte `offset`.
    fn write_buffer(
        &self,
        queue: &Self::Queue,
        mem: &mut Self::Mem,
        offset: usize,
        data: &[u8],
    ) -> ClResult<()>;

    /// Blocking read into `out` from byte `offset`.
    fn read_buffer(
        &self,
        queue: &Self::Queue,
        mem: &Self::Mem,
        offset: usize,
        out: &mut [u8],
    ) -> ClResult<()>;

    fn copy_buffer(
        &self,
        queue: &Self::Queue,
        src: &Self::Mem,
        dst: &mut Self::Mem,
        len: usize,
    ) -> ClResult<()>;

    fn build_program(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        source: &str,
        options: &str,
    ) -> Result<Self::Program, BuildError>;

    fn create_kernel(&self, program: &Self::Program, entry: &str) -> ClResult<Self::Kernel>;

    fn set_kernel_arg(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Mem>,
    ) -> ClResult<()>;

    /// Enqueue an N-dimensional range; `global.len()` is the work dimension.
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> ClResult<()>;

    fn finish(&self, queue: &Self::Queue) -> ClResult<()>;
}
