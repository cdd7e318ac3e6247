//! A simulated OpenCL device.
//!
//! [`SimDriver`] implements [`Driver`] entirely in host memory: platforms
//! and devices are configured up front, buffers are byte vectors, "building"
//! a program scans it for `kernel void name(...)` entry points, and a kernel
//! runs whatever host closure was registered under its name. Every driver
//! call is counted so callers can assert what reached the device.
//!
//! ```
//! use clrun::sim::{SimDevice, SimDriver};
//! use clrun::{ArgType, ArgValue, Runtime};
//!
//! let driver = SimDriver::new(vec![SimDevice::gpu("sim", "NVIDIA")]);
//! driver.register_kernel("fill", |launch| {
//!     let value: u32 = launch.scalar(1)?;
//!     launch.write(0, &vec![value; launch.work_items()])
//! });
//!
//! let rt = Runtime::simulated(driver.clone()).unwrap();
//! let out = rt.create_buffer(16, "out").unwrap();
//! let mut fill = rt.create_kernel_from_source(
//!     "__kernel void fill(__global uint* out, uint v) {}",
//!     "fill",
//!     &[ArgType::Mem, ArgType::UInt],
//! );
//! fill.run_with(&[4], None, [ArgValue::from(&out), ArgValue::from(7u32)]).unwrap();
//! assert_eq!(out.read::<u32>().unwrap(), vec![7; 4]);
//! assert_eq!(driver.stats().enqueues, 1);
//! ```

mod launch;

pub use launch::SimLaunch;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::driver::{BuildError, DeviceClass, DeviceInfo, Driver, KernelArg, QueueCreation};
use crate::{ClError, ClResult};

/// Body of a simulated kernel.
pub type KernelFn = Rc<dyn Fn(&mut SimLaunch<'_>) -> Result<(), String>>;

/// A configurable simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    info: DeviceInfo,
    fail_context: bool,
}

impl SimDevice {
    pub fn new(name: &str, vendor: &str, class: DeviceClass) -> Self {
        Self {
            info: DeviceInfo {
                name: name.to_string(),
                vendor: vendor.to_string(),
                version: "OpenCL 1.2 clrun-sim".to_string(),
                profile: "FULL_PROFILE".to_string(),
                platform: "clrun simulator".to_string(),
                class: Some(class),
                max_work_group_size: 1024,
                max_work_item_sizes: vec![1024, 1024, 64],
                max_mem_alloc_size: 1 << 30,
                global_mem_size: 4 << 30,
                local_mem_size: 48 << 10,
                max_constant_buffer_size: 64 << 10,
                profiling_timer_resolution: 1,
                max_compute_units: 16,
            },
            fail_context: false,
        }
    }

    pub fn gpu(name: &str, vendor: &str) -> Self {
        Self::new(name, vendor, DeviceClass::Gpu)
    }

    pub fn cpu(name: &str, vendor: &str) -> Self {
        Self::new(name, vendor, DeviceClass::Cpu)
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.info.version = version.to_string();
        self
    }

    pub fn with_work_item_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.info.max_work_item_sizes = sizes;
        self
    }

    pub fn with_max_alloc(mut self, bytes: u64) -> Self {
        self.info.max_mem_alloc_size = bytes;
        self
    }

    /// Context creation on this device fails.
    pub fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub contexts: usize,
    pub queues: usize,
    pub builds: usize,
    pub kernels_created: usize,
    pub arg_binds: usize,
    pub enqueues: usize,
    pub finishes: usize,
    pub writes: usize,
    pub reads: usize,
    pub copies: usize,
    pub copied_bytes: usize,
    pub allocations: usize,
    pub releases: usize,
}

/// One recorded program build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBuild {
    pub source: String,
    pub options: String,
}

#[derive(Debug, Clone)]
pub(crate) enum SimArg {
    Mem(u64),
    Bytes(Vec<u8>),
    Local(usize),
}

struct SimState {
    platforms: Vec<Vec<SimDevice>>,
    cl2_runtime: Cell<bool>,
    build_logs: Cell<bool>,
    kernels: RefCell<HashMap<String, KernelFn>>,
    memory: RefCell<HashMap<u64, Vec<u8>>>,
    next_mem: Cell<u64>,
    stats: Cell<SimStats>,
    builds: RefCell<Vec<SimBuild>>,
    queue_creations: RefCell<Vec<QueueCreation>>,
    bound: RefCell<Vec<(String, u32)>>,
}

impl SimState {
    fn bump(&self, f: impl FnOnce(&mut SimStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

/// In-process [`Driver`]. Clones share the same simulated machine.
#[derive(Clone)]
pub struct SimDriver {
    state: Rc<SimState>,
}

impl fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimDriver")
            .field("platforms", &self.state.platforms.len())
            .field("stats", &self.state.stats.get())
            .finish_non_exhaustive()
    }
}

impl SimDriver {
    /// One platform holding `devices`.
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self::with_platforms(vec![devices])
    }

    pub fn with_platforms(platforms: Vec<Vec<SimDevice>>) -> Self {
        Self {
            state: Rc::new(SimState {
                platforms,
                cl2_runtime: Cell::new(true),
                build_logs: Cell::new(true),
                kernels: RefCell::new(HashMap::new()),
                memory: RefCell::new(HashMap::new()),
                next_mem: Cell::new(1),
                stats: Cell::new(SimStats::default()),
                builds: RefCell::new(Vec::new()),
                queue_creations: RefCell::new(Vec::new()),
                bound: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Whether the simulated host library reports OpenCL 2.0 support.
    pub fn with_cl2_runtime(self, on: bool) -> Self {
        self.state.cl2_runtime.set(on);
        self
    }

    /// Failed builds report no build log.
    pub fn without_build_logs(self) -> Self {
        self.state.build_logs.set(false);
        self
    }

    /// Run `body` when a kernel named `name` is enqueued. Kernels with no
    /// registered body do nothing.
    pub fn register_kernel<F>(&self, name: &str, body: F) -> &Self
    where
        F: Fn(&mut SimLaunch<'_>) -> Result<(), String> + 'static,
    {
        self.state
            .kernels
            .borrow_mut()
            .insert(name.to_string(), Rc::new(body));
        self
    }

    pub fn stats(&self) -> SimStats {
        self.state.stats.get()
    }

    pub fn reset_stats(&self) {
        self.state.stats.set(SimStats::default());
        self.state.bound.borrow_mut().clear();
    }

    pub fn builds(&self) -> Vec<SimBuild> {
        self.state.builds.borrow().clone()
    }

    pub fn last_build_options(&self) -> Option<String> {
        self.state.builds.borrow().last().map(|b| b.options.clone())
    }

    pub fn queue_creations(&self) -> Vec<QueueCreation> {
        self.state.queue_creations.borrow().clone()
    }

    /// `(kernel, index)` of every argument bind since the last reset.
    pub fn bound_args(&self) -> Vec<(String, u32)> {
        self.state.bound.borrow().clone()
    }

    /// Buffers currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.state.memory.borrow().len()
    }

    fn sim_device(&self, id: SimDeviceId) -> ClResult<&SimDevice> {
        self.state
            .platforms
            .get(id.platform)
            .and_then(|p| p.get(id.index))
            .ok_or_else(|| ClError::device("clGetDeviceInfo", "CL_INVALID_DEVICE"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDeviceId {
    platform: usize,
    index: usize,
}

pub struct SimContext {
    device: SimDeviceId,
}

#[derive(Debug)]
pub struct SimQueue {
    pub creation: QueueCreation,
    pub profiling: bool,
}

/// Simulated device memory; dropping it frees the allocation.
pub struct SimMem {
    id: u64,
    state: Rc<SimState>,
}

impl Drop for SimMem {
    fn drop(&mut self) {
        self.state.memory.borrow_mut().remove(&self.id);
        self.state.bump(|s| s.releases += 1);
    }
}

pub struct SimProgram {
    source: Rc<str>,
    entries: Vec<(String, usize)>,
}

pub struct SimKernel {
    name: String,
    source: Rc<str>,
    args: RefCell<Vec<Option<SimArg>>>,
    body: Option<KernelFn>,
}

/// Entry points declared as `kernel void name(params)`, with their arity.
fn scan_entries(source: &str) -> Vec<(String, usize)> {
    const MARKER: &str = "kernel void ";
    let mut entries = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find(MARKER) {
        rest = &rest[pos + MARKER.len()..];
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        let params = rest
            .find('(')
            .and_then(|open| rest[open + 1..].find(')').map(|close| &rest[open + 1..open + 1 + close]));
        let arity = match params.map(str::trim) {
            None | Some("") | Some("void") => 0,
            Some(p) => p.split(',').count(),
        };
        if !name.is_empty() {
            entries.push((name, arity));
        }
    }
    entries
}

impl Driver for SimDriver {
    type Platform = usize;
    type Device = SimDeviceId;
    type Context = SimContext;
    type Queue = SimQueue;
    type Mem = SimMem;
    type Program = SimProgram;
    type Kernel = SimKernel;

    fn platforms(&self) -> ClResult<Vec<usize>> {
        Ok((0..self.state.platforms.len()).collect())
    }

    fn devices(&self, platform: &usize, filter: Option<DeviceClass>) -> ClResult<Vec<SimDeviceId>> {
        let devices = self
            .state
            .platforms
            .get(*platform)
            .ok_or_else(|| ClError::device("clGetDeviceIDs", "CL_INVALID_PLATFORM"))?;
        Ok(devices
            .iter()
            .enumerate()
            .filter(|(_, d)| filter.map_or(true, |f| d.info.class == Some(f)))
            .map(|(index, _)| SimDeviceId {
                platform: *platform,
                index,
            })
            .collect())
    }

    fn device_info(&self, device: &SimDeviceId) -> ClResult<DeviceInfo> {
        Ok(self.sim_device(*device)?.info.clone())
    }

    fn runtime_supports_cl2(&self) -> bool {
        self.state.cl2_runtime.get()
    }

    fn create_context(&self, _platform: &usize, device: &SimDeviceId) -> ClResult<SimContext> {
        if self.sim_device(*device)?.fail_context {
            return Err(ClError::device("clCreateContext", "CL_DEVICE_NOT_AVAILABLE"));
        }
        self.state.bump(|s| s.contexts += 1);
        Ok(SimContext { device: *device })
    }

    fn create_queue(
        &self,
        _context: &SimContext,
        _device: &SimDeviceId,
        creation: QueueCreation,
        profiling: bool,
    ) -> ClResult<SimQueue> {
        self.state.queue_creations.borrow_mut().push(creation);
        self.state.bump(|s| s.queues += 1);
        Ok(SimQueue {
            creation,
            profiling,
        })
    }

    fn create_buffer(&self, context: &SimContext, size: usize) -> ClResult<SimMem> {
        let max = self.sim_device(context.device)?.info.max_mem_alloc_size;
        if size == 0 || size as u64 > max {
            return Err(ClError::device("clCreateBuffer", "CL_INVALID_BUFFER_SIZE"));
        }
        let id = self.state.next_mem.get();
        self.state.next_mem.set(id + 1);
        self.state.memory.borrow_mut().insert(id, vec![0; size]);
        self.state.bump(|s| s.allocations += 1);
        Ok(SimMem {
            id,
            state: Rc::clone(&self.state),
        })
    }

    fn write_buffer(
        &self,
        _queue: &SimQueue,
        mem: &mut SimMem,
        offset: usize,
        data: &[u8],
    ) -> ClResult<()> {
        let mut memory = self.state.memory.borrow_mut();
        let dst = memory
            .get_mut(&mem.id)
            .and_then(|m| m.get_mut(offset..offset + data.len()))
            .ok_or_else(|| ClError::device("clEnqueueWriteBuffer", "CL_INVALID_VALUE"))?;
        dst.copy_from_slice(data);
        self.state.bump(|s| s.writes += 1);
        Ok(())
    }

    fn read_buffer(
        &self,
        _queue: &SimQueue,
        mem: &SimMem,
        offset: usize,
        out: &mut [u8],
    ) -> ClResult<()> {
        let memory = self.state.memory.borrow();
        let src = memory
            .get(&mem.id)
            .and_then(|m| m.get(offset..offset + out.len()))
            .ok_or_else(|| ClError::device("clEnqueueReadBuffer", "CL_INVALID_VALUE"))?;
        out.copy_from_slice(src);
        self.state.bump(|s| s.reads += 1);
        Ok(())
    }

    fn copy_buffer(
        &self,
        _queue: &SimQueue,
        src: &SimMem,
        dst: &mut SimMem,
        len: usize,
    ) -> ClResult<()> {
        let mut memory = self.state.memory.borrow_mut();
        let bytes = memory
            .get(&src.id)
            .and_then(|m| m.get(..len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ClError::device("clEnqueueCopyBuffer", "CL_INVALID_VALUE"))?;
        let target = memory
            .get_mut(&dst.id)
            .and_then(|m| m.get_mut(..len))
            .ok_or_else(|| ClError::device("clEnqueueCopyBuffer", "CL_INVALID_VALUE"))?;
        target.copy_from_slice(&bytes);
        self.state.bump(|s| {
            s.copies += 1;
            s.copied_bytes += len;
        });
        Ok(())
    }

    fn build_program(
        &self,
        _context: &SimContext,
        _device: &SimDeviceId,
        source: &str,
        options: &str,
    ) -> Result<SimProgram, BuildError> {
        self.state.builds.borrow_mut().push(SimBuild {
            source: source.to_string(),
            options: options.to_string(),
        });
        self.state.bump(|s| s.builds += 1);

        let errors: Vec<&str> = source
            .lines()
            .filter(|l| l.trim_start().starts_with("#error"))
            .collect();
        if !errors.is_empty() {
            let log = self.state.build_logs.get().then(|| {
                errors
                    .iter()
                    .map(|l| format!("<source>: error: {}", l.trim_start()))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            return Err(BuildError {
                reason: "CL_BUILD_PROGRAM_FAILURE".to_string(),
                log,
            });
        }
        Ok(SimProgram {
            source: Rc::from(source),
            entries: scan_entries(source),
        })
    }

    fn create_kernel(&self, program: &SimProgram, entry: &str) -> ClResult<SimKernel> {
        let arity = program
            .entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, arity)| *arity)
            .ok_or_else(|| ClError::device("clCreateKernel", "CL_INVALID_KERNEL_NAME"))?;
        self.state.bump(|s| s.kernels_created += 1);
        Ok(SimKernel {
            name: entry.to_string(),
            source: Rc::clone(&program.source),
            args: RefCell::new(vec![None; arity]),
            body: self.state.kernels.borrow().get(entry).cloned(),
        })
    }

    fn set_kernel_arg(&self, kernel: &SimKernel, index: u32, arg: KernelArg<'_, SimMem>) -> ClResult<()> {
        let value = match arg {
            KernelArg::Mem(mem) => SimArg::Mem(mem.id),
            KernelArg::Scalar(s) => SimArg::Bytes(s.to_ne_bytes()),
            KernelArg::Local(0) => {
                return Err(ClError::device("clSetKernelArg", "CL_INVALID_ARG_SIZE"));
            }
            KernelArg::Local(n) => SimArg::Local(n),
        };
        let mut args = kernel.args.borrow_mut();
        let slot = args
            .get_mut(index as usize)
            .ok_or_else(|| ClError::device("clSetKernelArg", "CL_INVALID_ARG_INDEX"))?;
        *slot = Some(value);
        self.state
            .bound
            .borrow_mut()
            .push((kernel.name.clone(), index));
        self.state.bump(|s| s.arg_binds += 1);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        _queue: &SimQueue,
        kernel: &SimKernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> ClResult<()> {
        let args: Vec<SimArg> = kernel
            .args
            .borrow()
            .iter()
            .cloned()
            .collect::<Option<_>>()
            .ok_or_else(|| ClError::device("clEnqueueNDRangeKernel", "CL_INVALID_KERNEL_ARGS"))?;
        self.state.bump(|s| s.enqueues += 1);
        if let Some(body) = &kernel.body {
            let mut launch = SimLaunch::new(global, local, &args, &self.state.memory, &kernel.source);
            body(&mut launch).map_err(|e| ClError::device("clEnqueueNDRangeKernel", e))?;
        }
        Ok(())
    }

    fn finish(&self, _queue: &SimQueue) -> ClResult<()> {
        self.state.bump(|s| s.finishes += 1);
        Ok(())
    }
}
