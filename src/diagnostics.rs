//! Diagnostic events and the sinks that receive them.
//!
//! Components never call the `log` macros directly: they build an [`Event`]
//! and hand it to the [`DiagnosticSink`] held by the device context.
//! [`LogSink`] forwards to the `log` facade; [`RecordingSink`] keeps events
//! in memory so tests can assert on them.

use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

use log::Level;

/// Something worth reporting.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// The device-kind token was not recognized.
    DeviceKindFallback { requested: String, using: String },
    PlatformsFound { count: usize },
    DevicesFound { kind: String, count: usize },
    /// A ranked candidate could not be used.
    CandidateSkipped { device: String, reason: String },
    DeviceSelected {
        device: String,
        vendor: String,
        extended_queue: bool,
    },
    /// One of the summary lines describing the selected device.
    DeviceProperties { line: String },
    BufferAllocated { name: String, size: usize },
    BufferWritten { name: String, bytes: usize },
    BufferRead { name: String, bytes: usize },
    BufferCopied {
        from: String,
        to: String,
        bytes: usize,
    },
    BufferReleased { name: String },
    BuildStarted { entries: Vec<String>, options: String },
    BuildFailed { reason: String, log: Option<String> },
    KernelRecompile { kernel: String },
    ArgumentBound {
        kernel: String,
        index: usize,
        value: String,
    },
    KernelEnqueued {
        kernel: String,
        global: Vec<usize>,
        local: Option<Vec<usize>>,
    },
    KernelFinished { kernel: String, elapsed: Duration },
    KernelFailed { kernel: String, reason: String },
}

impl Event {
    pub fn level(&self) -> Level {
        match self {
            Event::DeviceKindFallback { .. } | Event::CandidateSkipped { .. } => Level::Warn,
            Event::BuildFailed { .. } | Event::KernelFailed { .. } => Level::Error,
            Event::PlatformsFound { .. }
            | Event::DevicesFound { .. }
            | Event::DeviceSelected { .. }
            | Event::DeviceProperties { .. }
            | Event::KernelRecompile { .. } => Level::Info,
            Event::BufferAllocated { .. }
            | Event::BufferReleased { .. }
            | Event::BuildStarted { .. }
            | Event::KernelEnqueued { .. }
            | Event::KernelFinished { .. } => Level::Debug,
            Event::BufferWritten { .. }
            | Event::BufferRead { .. }
            | Event::BufferCopied { .. }
            | Event::ArgumentBound { .. } => Level::Trace,
        }
    }

    /// Which part of the runtime emitted the event.
    pub fn component(&self) -> &'static str {
        match self {
            Event::DeviceKindFallback { .. }
            | Event::PlatformsFound { .. }
            | Event::DevicesFound { .. }
            | Event::CandidateSkipped { .. }
            | Event::DeviceSelected { .. }
            | Event::DeviceProperties { .. } => "device",
            Event::BufferAllocated { .. }
            | Event::BufferWritten { .. }
            | Event::BufferRead { .. }
            | Event::BufferCopied { .. }
            | Event::BufferReleased { .. } => "buffer",
            Event::BuildStarted { .. } | Event::BuildFailed { .. } => "program",
            Event::KernelRecompile { .. }
            | Event::ArgumentBound { .. }
            | Event::KernelEnqueued { .. }
            | Event::KernelFinished { .. }
            | Event::KernelFailed { .. } => "kernel",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DeviceKindFallback { requested, using } => write!(
                f,
                "unknown device kind {requested:?}, falling back to {using:?}"
            ),
            Event::PlatformsFound { count } => write!(f, "found {count} OpenCL platform(s)"),
            Event::DevicesFound { kind, count } => {
                write!(f, "found {count} OpenCL device(s) of kind {kind}")
            }
            Event::CandidateSkipped { device, reason } => {
                write!(f, "skipping device {device}: {reason}")
            }
            Event::DeviceSelected {
                device,
                vendor,
                extended_queue,
            } => write!(
                f,
                "using device {device} ({vendor}), {} queue",
                if *extended_queue { "2.0" } else { "1.x" }
            ),
            Event::DeviceProperties { line } => f.write_str(line),
            Event::BufferAllocated { name, size } => {
                write!(f, "allocated buffer {name} ({size} bytes)")
            }
            Event::BufferWritten { name, bytes } => write!(f, "wrote {bytes} bytes to {name}"),
            Event::BufferRead { name, bytes } => write!(f, "read {bytes} bytes from {name}"),
            Event::BufferCopied { from, to, bytes } => {
                write!(f, "copied {bytes} bytes from {from} to {to}")
            }
            Event::BufferReleased { name } => write!(f, "released buffer {name}"),
            Event::BuildStarted { entries, options } => {
                write!(f, "building [{}] with {options:?}", entries.join(", "))
            }
            Event::BuildFailed { reason, log } => match log {
                Some(log) => write!(f, "build failed: {reason}\n{log}"),
                None => write!(f, "build failed: {reason}"),
            },
            Event::KernelRecompile { kernel } => write!(f, "recompiling kernel {kernel}"),
            Event::ArgumentBound {
                kernel,
                index,
                value,
            } => write!(f, "{kernel}: arg {index} = {value}"),
            Event::KernelEnqueued {
                kernel,
                global,
                local,
            } => write!(f, "enqueue {kernel} global={global:?} local={local:?}"),
            Event::KernelFinished { kernel, elapsed } => {
                write!(f, "{kernel} finished in {:.3} ms", elapsed.as_secs_f64() * 1e3)
            }
            Event::KernelFailed { kernel, reason } => write!(f, "{kernel} failed: {reason}"),
        }
    }
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink {
    fn record(&self, event: &Event);
}

/// Forwards events to the `log` facade under target `clrun::<component>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&self, event: &Event) {
        let target = match event.component() {
            "device" => "clrun::device",
            "buffer" => "clrun::buffer",
            "program" => "clrun::program",
            _ => "clrun::kernel",
        };
        log::log!(target: target, event.level(), "{event}");
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _event: &Event) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: RefCell<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Events at `level` or more severe.
    pub fn at_least(&self, level: Level) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.level() <= level)
            .cloned()
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl DiagnosticSink for RecordingSink {
    fn record(&self, event: &Event) {
        self.events.borrow_mut().push(event.clone());
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for std::rc::Rc<S> {
    fn record(&self, event: &Event) {
        (**self).record(event);
    }
}
