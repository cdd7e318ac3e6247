//! Kernel objects: define-aware compilation and dirty-tracked arguments.
//!
//! A [`Kernel`] holds one entry point, its argument slots and its define
//! table. The compiled handle is cached until a define changes; argument
//! slots are only pushed to the driver when their value changed since the
//! last bind (or when a fresh compile produced a kernel with nothing bound).
//!
//! ```text
//!  NeedsSource ──(source read)──▶ NeedsCompile ──(compile)──▶ Compiled
//!                                      ▲                         │
//!                                      └──── define(changed) ────┘
//! ```

mod stats;

pub use stats::{KernelStats, RunTimings, MAX_TIMINGS};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use crate::device::DeviceContext;
use crate::diagnostics::Event;
use crate::driver::{Driver, KernelArg};
use crate::program;
use crate::types::{ArgType, ArgValue, DefineValue, Signature};
use crate::{ClError, ClResult};

/// Where a kernel's program text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// Read once, on first compile.
    File(PathBuf),
    Inline(String),
}

/// Compilation state of a [`Kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Source has not been read yet.
    NeedsSource,
    /// Source is cached but there is no current compiled handle.
    NeedsCompile,
    Compiled,
}

struct Slot<D: Driver> {
    name: Option<String>,
    ty: ArgType,
    value: Option<ArgValue<D>>,
    dirty: bool,
}

impl<D: Driver> Slot<D> {
    fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => format!("{index} ({name})"),
            None => index.to_string(),
        }
    }
}

/// One entry point of a program, with its arguments and defines.
pub struct Kernel<D: Driver> {
    compiled: Option<D::Kernel>,
    slots: Vec<Slot<D>>,
    defines: BTreeMap<String, DefineValue>,
    must_recompile: bool,
    entry: String,
    source: KernelSource,
    cached_source: Option<String>,
    timings: RunTimings,
    ctx: Rc<DeviceContext<D>>,
}

impl<D: Driver> fmt::Debug for Kernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("entry", &self.entry)
            .field("state", &self.state())
            .field("args", &self.slots.len())
            .field("defines", &self.defines)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Kernel<D> {
    pub(crate) fn new(
        ctx: Rc<DeviceContext<D>>,
        entry: impl Into<String>,
        source: KernelSource,
        signature: Signature,
    ) -> Self {
        let slots = signature
            .args()
            .map(|p| Slot {
                name: p.name.clone(),
                ty: p.ty,
                value: None,
                dirty: true,
            })
            .collect();
        let defines = signature
            .defines()
            .map(|name| (name.to_string(), DefineValue::Unset))
            .collect();
        Self {
            compiled: None,
            slots,
            defines,
            must_recompile: true,
            entry: entry.into(),
            source,
            cached_source: None,
            timings: RunTimings::default(),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.entry
    }

    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self) -> KernelState {
        if self.cached_source.is_none() {
            KernelState::NeedsSource
        } else if self.must_recompile || self.compiled.is_none() {
            KernelState::NeedsCompile
        } else {
            KernelState::Compiled
        }
    }

    /// Indices of slots that will be bound on the next run.
    pub fn dirty_args(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dirty)
            .map(|(i, _)| i)
            .collect()
    }

    /// Store argument values by position. Only slots whose value differs
    /// from the stored one are marked for rebinding.
    pub fn set<I>(&mut self, args: I) -> ClResult<&mut Self>
    where
        I: IntoIterator<Item = (usize, ArgValue<D>)>,
    {
        for (index, value) in args {
            let count = self.slots.len();
            let slot = self.slots.get_mut(index).ok_or_else(|| {
                ClError::usage(format!(
                    "kernel {} has {count} arguments, no argument {index}",
                    self.entry
                ))
            })?;
            if slot.value.as_ref() != Some(&value) {
                slot.value = Some(value);
                slot.dirty = true;
            }
        }
        Ok(self)
    }

    pub fn set_arg(&mut self, index: usize, value: impl Into<ArgValue<D>>) -> ClResult<&mut Self> {
        self.set([(index, value.into())])
    }

    /// Store values for slots `0..n` in order.
    pub fn set_positional<I>(&mut self, values: I) -> ClResult<&mut Self>
    where
        I: IntoIterator<Item = ArgValue<D>>,
    {
        self.set(values.into_iter().enumerate())
    }

    /// Store a value for the argument declared with `name`.
    pub fn set_named(&mut self, name: &str, value: impl Into<ArgValue<D>>) -> ClResult<&mut Self> {
        let index = self
            .slots
            .iter()
            .position(|s| s.name.as_deref() == Some(name))
            .ok_or_else(|| {
                ClError::usage(format!("kernel {} has no argument named {name}", self.entry))
            })?;
        self.set([(index, value.into())])
    }

    /// Current value of the argument declared with `name`.
    pub fn get(&self, name: &str) -> Option<&ArgValue<D>> {
        self.slots
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
            .and_then(|s| s.value.as_ref())
    }

    pub fn arg(&self, index: usize) -> Option<&ArgValue<D>> {
        self.slots.get(index).and_then(|s| s.value.as_ref())
    }

    pub fn define_value(&self, key: &str) -> Option<&DefineValue> {
        self.defines.get(key)
    }

    /// Set a preprocessor define. A changed value invalidates the compiled
    /// kernel; setting the same value again does nothing.
    pub fn define(&mut self, key: impl Into<String>, value: impl Into<DefineValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if self.defines.get(&key) != Some(&value) {
            self.defines.insert(key, value);
            self.must_recompile = true;
        }
        self
    }

    /// The `#define` lines emitted ahead of the source, ordered by key.
    pub fn prefix(&self) -> String {
        self.defines
            .iter()
            .filter_map(|(k, v)| v.directive(k))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn check_defines(&self) -> ClResult<()> {
        match self.defines.iter().find(|(_, v)| **v == DefineValue::Unset) {
            Some((key, _)) => Err(ClError::MissingDefine {
                kernel: self.entry.clone(),
                define: key.clone(),
            }),
            None => Ok(()),
        }
    }

    fn load_source(&mut self) -> ClResult<&str> {
        if self.cached_source.is_none() {
            let text = match &self.source {
                KernelSource::Inline(text) => text.clone(),
                KernelSource::File(path) => {
                    fs::read_to_string(path).map_err(|source| ClError::SourceUnavailable {
                        path: path.clone(),
                        source,
                    })?
                }
            };
            self.cached_source = Some(text);
        }
        Ok(self.cached_source.as_deref().unwrap_or_default())
    }

    /// Define prefix, a blank line, then the program source.
    pub fn preprocessed_source(&mut self) -> ClResult<String> {
        self.check_defines()?;
        let prefix = self.prefix();
        let source = self.load_source()?;
        Ok(format!("{prefix}\n\n{source}"))
    }

    /// Build the kernel now if its defines changed since the last build.
    pub fn compile(&mut self) -> ClResult<&mut Self> {
        if self.must_recompile || self.compiled.is_none() {
            let source = self.preprocessed_source()?;
            self.ctx.emit(Event::KernelRecompile {
                kernel: self.entry.clone(),
            });
            let built = program::compile(&self.ctx, &source, self.entry.as_str(), None)?;
            let kernel = built
                .take(&self.entry)
                .ok_or_else(|| ClError::KernelNotCompiled {
                    kernel: self.entry.clone(),
                })?;
            self.compiled = Some(kernel);
            self.must_recompile = false;
            // a new kernel object has nothing bound
            for slot in &mut self.slots {
                slot.dirty = true;
            }
        }
        Ok(self)
    }

    /// Compile if needed, bind dirty arguments, dispatch over `global` work
    /// items (1 to 3 dimensions) and wait for completion.
    pub fn run(&mut self, global: &[usize], local: Option<&[usize]>) -> ClResult<&mut Self> {
        match self.dispatch(global, local) {
            Ok(()) => Ok(self),
            Err(e) => {
                self.ctx.emit(Event::KernelFailed {
                    kernel: self.entry.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// [`set_positional`](Self::set_positional) followed by [`run`](Self::run).
    pub fn run_with<I>(
        &mut self,
        global: &[usize],
        local: Option<&[usize]>,
        args: I,
    ) -> ClResult<&mut Self>
    where
        I: IntoIterator<Item = ArgValue<D>>,
    {
        self.set_positional(args)?;
        self.run(global, local)
    }

    fn dispatch(&mut self, global: &[usize], local: Option<&[usize]>) -> ClResult<()> {
        check_work_size(global, local)?;
        self.compile()?;
        let kernel = self
            .compiled
            .as_ref()
            .ok_or_else(|| ClError::KernelNotCompiled {
                kernel: self.entry.clone(),
            })?;
        check_released(&self.entry, &mut self.slots)?;
        bind_dirty(&self.ctx, &self.entry, kernel, &mut self.slots)?;

        self.ctx.emit(Event::KernelEnqueued {
            kernel: self.entry.clone(),
            global: global.to_vec(),
            local: local.map(<[usize]>::to_vec),
        });
        let start = Instant::now();
        self.ctx
            .driver()
            .enqueue_kernel(self.ctx.queue(), kernel, global, local)?;
        self.ctx.finish()?;
        let elapsed = start.elapsed();
        self.timings.record(elapsed);
        self.ctx.emit(Event::KernelFinished {
            kernel: self.entry.clone(),
            elapsed,
        });
        Ok(())
    }

    pub fn runtime_stats(&self) -> KernelStats {
        self.timings.summarize(&self.entry)
    }
}

fn check_work_size(global: &[usize], local: Option<&[usize]>) -> ClResult<()> {
    if !(1..=3).contains(&global.len()) {
        return Err(ClError::usage(format!(
            "work size must have 1 to 3 dimensions, got {}",
            global.len()
        )));
    }
    if let Some(local) = local {
        if local.len() != global.len() {
            return Err(ClError::usage(format!(
                "local size has {} dimensions, global size has {}",
                local.len(),
                global.len()
            )));
        }
    }
    Ok(())
}

/// Fail on any buffer argument released since it was stored, bound or not.
/// The slot is marked dirty so the next run binds whatever it holds then.
fn check_released<D: Driver>(entry: &str, slots: &mut [Slot<D>]) -> ClResult<()> {
    for (index, slot) in slots.iter_mut().enumerate() {
        if let Some(ArgValue::Mem(buf)) = &slot.value {
            if buf.is_released() {
                slot.dirty = true;
                return Err(ClError::usage(format!(
                    "argument {} of kernel {entry} is released buffer {}",
                    slot.label(index),
                    buf.name()
                )));
            }
        }
    }
    Ok(())
}

/// Push every dirty slot to the driver, clearing its flag once bound. Stops
/// at the first failure; slots bound before it stay clean.
fn bind_dirty<D: Driver>(
    ctx: &Rc<DeviceContext<D>>,
    entry: &str,
    kernel: &D::Kernel,
    slots: &mut [Slot<D>],
) -> ClResult<()> {
    let driver = ctx.driver();
    for (index, slot) in slots.iter_mut().enumerate() {
        if !slot.dirty {
            continue;
        }
        let label = slot.label(index);
        let value = slot.value.as_ref().ok_or_else(|| {
            ClError::usage(format!("argument {label} of kernel {entry} was never set"))
        })?;
        if !slot.ty.accepts(value) {
            return Err(ClError::usage(format!(
                "argument {label} of kernel {entry} is declared {} but holds {}",
                slot.ty,
                value.arg_type()
            )));
        }
        let arg_index = index as u32;
        match value {
            ArgValue::Mem(buf) => {
                if !Rc::ptr_eq(buf.context(), ctx) {
                    return Err(ClError::usage(format!(
                        "buffer {} bound to kernel {entry} belongs to another context",
                        buf.name()
                    )));
                }
                buf.with_mem(|mem| driver.set_kernel_arg(kernel, arg_index, KernelArg::Mem(mem)))??;
            }
            ArgValue::Scalar(s) => driver.set_kernel_arg(kernel, arg_index, KernelArg::Scalar(s))?,
            ArgValue::Local(bytes) => {
                driver.set_kernel_arg(kernel, arg_index, KernelArg::Local(*bytes))?
            }
        }
        slot.dirty = false;
        ctx.emit(Event::ArgumentBound {
            kernel: entry.to_string(),
            index,
            value: value.to_string(),
        });
    }
    Ok(())
}
