//! [`Driver`] implementation on the system OpenCL library via `opencl3`.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//! The `cl2` feature additionally enables `clCreateCommandQueueWithProperties`
//! and `-cl-std=CL2.0` builds on devices that report OpenCL 2.0 or later.

use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU,
    CL_DEVICE_TYPE_DEFAULT, CL_DEVICE_TYPE_GPU,
};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_device_type, CL_BLOCKING};

use crate::driver::{BuildError, DeviceClass, DeviceInfo, Driver, KernelArg, QueueCreation};
use crate::types::Scalar;
use crate::{ClError, ClResult};

/// The system OpenCL implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenClDriver;

impl OpenClDriver {
    pub fn new() -> Self {
        OpenClDriver
    }
}

fn class_of(dev_type: cl_device_type) -> DeviceClass {
    if dev_type & CL_DEVICE_TYPE_GPU != 0 {
        DeviceClass::Gpu
    } else if dev_type & CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else if dev_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceClass::Accelerator
    } else {
        DeviceClass::Other
    }
}

fn type_mask(filter: Option<DeviceClass>) -> cl_device_type {
    match filter {
        None => CL_DEVICE_TYPE_ALL,
        Some(DeviceClass::Cpu) => CL_DEVICE_TYPE_CPU,
        Some(DeviceClass::Gpu) => CL_DEVICE_TYPE_GPU,
        Some(DeviceClass::Accelerator) => CL_DEVICE_TYPE_ACCELERATOR,
        Some(DeviceClass::Other) => CL_DEVICE_TYPE_DEFAULT,
    }
}

/// Set a by-value argument with the width of its OpenCL type.
///
/// # Safety
/// `kernel` must be a valid kernel and `index` within its argument count.
unsafe fn set_scalar(kernel: &Kernel, index: u32, value: &Scalar) -> opencl3::Result<()> {
    match value {
        Scalar::Char(v) => kernel.set_arg(index, v),
        Scalar::UChar(v) => kernel.set_arg(index, v),
        Scalar::Short(v) => kernel.set_arg(index, v),
        Scalar::UShort(v) | Scalar::Half(v) => kernel.set_arg(index, v),
        Scalar::Int(v) => kernel.set_arg(index, v),
        Scalar::UInt(v) => kernel.set_arg(index, v),
        Scalar::Long(v) => kernel.set_arg(index, v),
        Scalar::ULong(v) => kernel.set_arg(index, v),
        Scalar::Float(v) => kernel.set_arg(index, v),
        Scalar::Double(v) => kernel.set_arg(index, v),
        Scalar::Float2(v) => kernel.set_arg(index, v),
        // float3 has the size and alignment of float4
        Scalar::Float3([x, y, z]) => kernel.set_arg(index, &[*x, *y, *z, 0.0f32]),
        Scalar::Float4(v) => kernel.set_arg(index, v),
        Scalar::Float8(v) => kernel.set_arg(index, v),
        Scalar::Float16(v) => kernel.set_arg(index, v),
    }
}

// clCreateCommandQueue is deprecated in 2.0 headers but is the only entry
// point on 1.x runtimes.
#[allow(deprecated)]
fn legacy_queue(
    context: &Context,
    props: opencl3::types::cl_command_queue_properties,
) -> opencl3::Result<CommandQueue> {
    CommandQueue::create_default(context, props)
}

impl Driver for OpenClDriver {
    type Platform = Platform;
    type Device = Device;
    type Context = Context;
    type Queue = CommandQueue;
    type Mem = Buffer<u8>;
    type Program = Program;
    type Kernel = Kernel;

    fn platforms(&self) -> ClResult<Vec<Platform>> {
        // An ICD loader with no vendor drivers reports an error here.
        Ok(get_platforms().unwrap_or_default())
    }

    fn devices(&self, platform: &Platform, filter: Option<DeviceClass>) -> ClResult<Vec<Device>> {
        // CL_DEVICE_NOT_FOUND is an error from the API but an empty list here.
        Ok(platform
            .get_devices(type_mask(filter))
            .unwrap_or_default()
            .into_iter()
            .map(Device::new)
            .collect())
    }

    fn device_info(&self, device: &Device) -> ClResult<DeviceInfo> {
        let platform = device
            .platform()
            .ok()
            .and_then(|id| Platform::new(id).name().ok())
            .unwrap_or_default();
        Ok(DeviceInfo {
            name: device
                .name()
                .map_err(|e| ClError::device("clGetDeviceInfo", format!("{e:?}")))?,
            vendor: device.vendor().unwrap_or_default(),
            version: device.version().unwrap_or_default(),
            profile: device.profile().unwrap_or_default(),
            platform,
            class: device.dev_type().ok().map(class_of),
            max_work_group_size: device.max_work_group_size().unwrap_or(1),
            max_work_item_sizes: device.max_work_item_sizes().unwrap_or_default(),
            max_mem_alloc_size: device.max_mem_alloc_size().unwrap_or(0),
            global_mem_size: device.global_mem_size().unwrap_or(0),
            local_mem_size: device.local_mem_size().unwrap_or(0),
            max_constant_buffer_size: device.max_constant_buffer_size().unwrap_or(0),
            profiling_timer_resolution: device.profiling_timer_resolution().unwrap_or(0),
            max_compute_units: device.max_compute_units().unwrap_or(0),
        })
    }

    fn runtime_supports_cl2(&self) -> bool {
        cfg!(feature = "cl2")
    }

    fn create_context(&self, _platform: &Platform, device: &Device) -> ClResult<Context> {
        Context::from_device(device).map_err(|e| ClError::device("clCreateContext", format!("{e:?}")))
    }

    fn create_queue(
        &self,
        context: &Context,
        _device: &Device,
        creation: QueueCreation,
        profiling: bool,
    ) -> ClResult<CommandQueue> {
        let props = if profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };
        let queue = match creation {
            #[cfg(feature = "cl2")]
            QueueCreation::WithProperties => {
                CommandQueue::create_default_with_properties(context, props, 0)
            }
            #[cfg(not(feature = "cl2"))]
            QueueCreation::WithProperties => {
                return Err(ClError::device(
                    "clCreateCommandQueueWithProperties",
                    "built without the cl2 feature",
                ));
            }
            QueueCreation::Legacy => legacy_queue(context, props),
        };
        queue.map_err(|e| ClError::device("clCreateCommandQueue", format!("{e:?}")))
    }

    fn create_buffer(&self, context: &Context, size: usize) -> ClResult<Buffer<u8>> {
        // SAFETY: no host pointer is passed, so nothing is aliased.
        unsafe { Buffer::<u8>::create(context, CL_MEM_READ_WRITE, size, ptr::null_mut()) }
            .map_err(|e| ClError::device("clCreateBuffer", format!("{e:?}")))
    }

    fn write_buffer(
        &self,
        queue: &CommandQueue,
        mem: &mut Buffer<u8>,
        offset: usize,
        data: &[u8],
    ) -> ClResult<()> {
        // SAFETY: blocking write; `data` outlives the call.
        unsafe { queue.enqueue_write_buffer(mem, CL_BLOCKING, offset, data, &[]) }
            .map(|_| ())
            .map_err(|e| ClError::device("clEnqueueWriteBuffer", format!("{e:?}")))
    }

    fn read_buffer(
        &self,
        queue: &CommandQueue,
        mem: &Buffer<u8>,
        offset: usize,
        out: &mut [u8],
    ) -> ClResult<()> {
        // SAFETY: blocking read; `out` outlives the call.
        unsafe { queue.enqueue_read_buffer(mem, CL_BLOCKING, offset, out, &[]) }
            .map(|_| ())
            .map_err(|e| ClError::device("clEnqueueReadBuffer", format!("{e:?}")))
    }

    fn copy_buffer(
        &self,
        queue: &CommandQueue,
        src: &Buffer<u8>,
        dst: &mut Buffer<u8>,
        len: usize,
    ) -> ClResult<()> {
        // SAFETY: both buffers are live and at least `len` bytes long.
        unsafe { queue.enqueue_copy_buffer(src, dst, 0, 0, len, &[]) }
            .map(|_| ())
            .map_err(|e| ClError::device("clEnqueueCopyBuffer", format!("{e:?}")))
    }

    fn build_program(
        &self,
        context: &Context,
        device: &Device,
        source: &str,
        options: &str,
    ) -> Result<Program, BuildError> {
        let mut program = Program::create_from_source(context, source).map_err(|e| BuildError {
            reason: format!("clCreateProgramWithSource: {e:?}"),
            log: None,
        })?;
        match program.build(&[device.id()], options) {
            Ok(()) => Ok(program),
            Err(e) => Err(BuildError {
                reason: format!("clBuildProgram: {e:?}"),
                log: program.get_build_log(device.id()).ok(),
            }),
        }
    }

    fn create_kernel(&self, program: &Program, entry: &str) -> ClResult<Kernel> {
        Kernel::create(program, entry).map_err(|e| ClError::device("clCreateKernel", format!("{e:?}")))
    }

    fn set_kernel_arg(&self, kernel: &Kernel, index: u32, arg: KernelArg<'_, Buffer<u8>>) -> ClResult<()> {
        // SAFETY: argument types were checked against the declared signature.
        let result = unsafe {
            match arg {
                KernelArg::Mem(mem) => kernel.set_arg(index, &mem.get()),
                KernelArg::Scalar(value) => set_scalar(kernel, index, value),
                KernelArg::Local(bytes) => kernel.set_arg_local_buffer(index, bytes),
            }
        };
        result.map_err(|e| ClError::device("clSetKernelArg", format!("{e:?}")))
    }

    fn enqueue_kernel(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> ClResult<()> {
        let local_ptr = local.map_or(ptr::null(), <[usize]>::as_ptr);
        // SAFETY: `global` and `local` have `global.len()` entries and
        // outlive the call.
        unsafe {
            queue.enqueue_nd_range_kernel(
                kernel.get(),
                global.len() as u32,
                ptr::null(),
                global.as_ptr(),
                local_ptr,
                &[],
            )
        }
        .map(|_| ())
        .map_err(|e| ClError::device("clEnqueueNDRangeKernel", format!("{e:?}")))
    }

    fn finish(&self, queue: &CommandQueue) -> ClResult<()> {
        queue
            .finish()
            .map_err(|e| ClError::device("clFinish", format!("{e:?}")))
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
