//! Building program source into kernel handles.

use std::collections::HashMap;
use std::path::Path;

use crate::device::DeviceContext;
use crate::diagnostics::Event;
use crate::driver::Driver;
use crate::{ClError, ClResult};

/// Which kernels to pull out of a built program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoints {
    One(String),
    Many(Vec<String>),
}

impl EntryPoints {
    pub fn names(&self) -> Vec<String> {
        match self {
            EntryPoints::One(name) => vec![name.clone()],
            EntryPoints::Many(names) => names.clone(),
        }
    }
}

impl From<&str> for EntryPoints {
    fn from(name: &str) -> Self {
        EntryPoints::One(name.to_string())
    }
}

impl From<String> for EntryPoints {
    fn from(name: String) -> Self {
        EntryPoints::One(name)
    }
}

impl From<&[&str]> for EntryPoints {
    fn from(names: &[&str]) -> Self {
        EntryPoints::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for EntryPoints {
    fn from(names: [&str; N]) -> Self {
        Self::from(&names[..])
    }
}

impl From<Vec<String>> for EntryPoints {
    fn from(names: Vec<String>) -> Self {
        EntryPoints::Many(names)
    }
}

/// Kernels resolved from a build, shaped like the [`EntryPoints`] request.
pub enum CompiledKernels<K> {
    One(K),
    Many(HashMap<String, K>),
}

impl<K> CompiledKernels<K> {
    pub fn len(&self) -> usize {
        match self {
            CompiledKernels::One(_) => 1,
            CompiledKernels::Many(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, entry: &str) -> Option<&K> {
        match self {
            CompiledKernels::One(k) => Some(k),
            CompiledKernels::Many(map) => map.get(entry),
        }
    }

    /// Take the kernel for `entry`. A single-entry result is returned
    /// whatever its name.
    pub fn take(self, entry: &str) -> Option<K> {
        match self {
            CompiledKernels::One(k) => Some(k),
            CompiledKernels::Many(mut map) => map.remove(entry),
        }
    }

    pub fn into_map(self, entry: &str) -> HashMap<String, K> {
        match self {
            CompiledKernels::One(k) => HashMap::from([(entry.to_string(), k)]),
            CompiledKernels::Many(map) => map,
        }
    }
}

/// Compiler options: `-I <dir>`, `-cl-fast-relaxed-math`, `-cl-std=CL2.0`,
/// then `extra`, space separated.
pub fn build_options(
    include_dir: Option<&Path>,
    fast_relaxed_math: bool,
    cl2: bool,
    extra: &str,
) -> String {
    let mut opts = Vec::new();
    if let Some(dir) = include_dir {
        opts.push(format!("-I {}", dir.display()));
    }
    if fast_relaxed_math {
        opts.push("-cl-fast-relaxed-math".to_string());
    }
    if cl2 {
        opts.push("-cl-std=CL2.0".to_string());
    }
    let extra = extra.trim();
    if !extra.is_empty() {
        opts.push(extra.to_string());
    }
    opts.join(" ")
}

/// Build `source` for the context's device and resolve `entries`.
///
/// `include_dir` overrides the configured include directory. On a build
/// failure the driver's build log is carried in [`ClError::BuildFailed`]
/// when it could be retrieved.
pub fn compile<D: Driver>(
    ctx: &DeviceContext<D>,
    source: &str,
    entries: impl Into<EntryPoints>,
    include_dir: Option<&Path>,
) -> ClResult<CompiledKernels<D::Kernel>> {
    let entries = entries.into();
    let config = ctx.config();
    let options = build_options(
        include_dir.or(config.include_dir.as_deref()),
        config.fast_relaxed_math,
        ctx.supports_cl2(),
        &config.extra_build_options,
    );
    ctx.emit(Event::BuildStarted {
        entries: entries.names(),
        options: options.clone(),
    });

    let program = ctx
        .driver()
        .build_program(ctx.context(), ctx.device(), source, &options)
        .map_err(|e| {
            ctx.emit(Event::BuildFailed {
                reason: e.reason.clone(),
                log: e.log.clone(),
            });
            ClError::BuildFailed {
                reason: e.reason,
                log: e.log,
            }
        })?;

    let create = |entry: &str| {
        ctx.driver()
            .create_kernel(&program, entry)
            .map_err(|e| ClError::KernelCreationFailed {
                entry: entry.to_string(),
                reason: e.to_string(),
            })
    };
    match entries {
        EntryPoints::One(entry) => Ok(CompiledKernels::One(create(&entry)?)),
        EntryPoints::Many(names) => {
            let mut map = HashMap::with_capacity(names.len());
            for name in names {
                let kernel = create(&name)?;
                map.insert(name, kernel);
            }
            Ok(CompiledKernels::Many(map))
        }
    }
}
