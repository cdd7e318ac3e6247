//! Runtime configuration.

use std::path::{Path, PathBuf};

/// Settings for device selection and program builds.
///
/// ```
/// use clrun::RuntimeConfig;
///
/// let cfg = RuntimeConfig::default()
///     .with_device("gpu")
///     .with_kernel_dir("shaders")
///     .with_fast_relaxed_math(false);
/// assert_eq!(cfg.device, "gpu");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Device-kind token: `cpu`, `gpu`, `all`, `any` or `default`.
    pub device: String,
    /// Vendor substring to prefer; `default` means nvidia.
    pub vendor: String,
    /// Directory kernel source files are read from.
    pub kernel_dir: PathBuf,
    /// Passed to the compiler as `-I <dir>`.
    pub include_dir: Option<PathBuf>,
    pub fast_relaxed_math: bool,
    /// Appended after the generated build options.
    pub extra_build_options: String,
    /// Request a profiling-enabled command queue.
    pub profiling: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: "all".to_string(),
            vendor: "default".to_string(),
            kernel_dir: PathBuf::from("kernels"),
            include_dir: None,
            fast_relaxed_math: true,
            extra_build_options: String::new(),
            profiling: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn with_kernel_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.kernel_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_include_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.include_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_fast_relaxed_math(mut self, on: bool) -> Self {
        self.fast_relaxed_math = on;
        self
    }

    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.extra_build_options = options.into();
        self
    }

    pub fn with_profiling(mut self, on: bool) -> Self {
        self.profiling = on;
        self
    }

    /// Defaults overridden by `CLRUN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("CLRUN_DEVICE") {
            cfg.device = v;
        }
        if let Some(v) = lookup("CLRUN_VENDOR") {
            cfg.vendor = v;
        }
        if let Some(v) = lookup("CLRUN_KERNEL_DIR") {
            cfg.kernel_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLRUN_INCLUDE_DIR").filter(|v| !v.is_empty()) {
            cfg.include_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CLRUN_FAST_MATH") {
            cfg.fast_relaxed_math = parse_flag(&v, cfg.fast_relaxed_math);
        }
        if let Some(v) = lookup("CLRUN_BUILD_OPTIONS") {
            cfg.extra_build_options = v;
        }
        if let Some(v) = lookup("CLRUN_PROFILING") {
            cfg.profiling = parse_flag(&v, cfg.profiling);
        }
        cfg
    }
}

fn parse_flag(value: &str, fallback: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}
