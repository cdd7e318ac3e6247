//! Device discovery, ranking and context acquisition.
//!
//! Only the first platform is considered. Its devices of the requested kind
//! are ranked (preferred vendor first, then by work-item capacity) and each
//! candidate is tried in turn until one yields a context and a command
//! queue. Some drivers list devices that refuse context creation, so a
//! failing candidate is reported and skipped rather than treated as fatal.

use std::fmt;

use crate::config::RuntimeConfig;
use crate::diagnostics::{DiagnosticSink, Event};
use crate::driver::{DeviceClass, DeviceInfo, Driver, QueueCreation};
use crate::{ClError, ClResult};

/// Vendor substring used when the preference is `default` or empty.
pub const DEFAULT_VENDOR: &str = "nvidia";

/// Requested device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    All,
}

impl DeviceKind {
    /// Parse a kind token (`cpu`, `gpu`, `all`, `any`, `default`),
    /// ignoring case.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(DeviceKind::Cpu),
            "gpu" => Some(DeviceKind::Gpu),
            "all" | "any" | "default" => Some(DeviceKind::All),
            _ => None,
        }
    }

    /// Like [`parse`](Self::parse), but unknown tokens become `All` and are
    /// reported to `sink` as a warning.
    pub fn resolve(token: &str, sink: &dyn DiagnosticSink) -> Self {
        Self::parse(token).unwrap_or_else(|| {
            sink.record(&Event::DeviceKindFallback {
                requested: token.to_string(),
                using: DeviceKind::All.to_string(),
            });
            DeviceKind::All
        })
    }

    pub fn filter(self) -> Option<DeviceClass> {
        match self {
            DeviceKind::Cpu => Some(DeviceClass::Cpu),
            DeviceKind::Gpu => Some(DeviceClass::Gpu),
            DeviceKind::All => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::All => "all",
        })
    }
}

/// `major.minor` OpenCL version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClVersion {
    pub const CL2_0: ClVersion = ClVersion { major: 2, minor: 0 };

    /// Parse a device version string of the form
    /// `OpenCL <major>.<minor> <vendor-specific>`.
    pub fn parse(version: &str) -> Option<Self> {
        let number = version
            .split_whitespace()
            .find(|part| part.starts_with(|c: char| c.is_ascii_digit()))?;
        let (major, minor) = number.split_once('.')?;
        let minor: String = minor.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(ClVersion {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for ClVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Capability properties of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProps {
    pub name: String,
    pub vendor: String,
    /// `CPU`, `GPU`, `ACCELERATOR` or `DEFAULT`.
    pub kind: String,
    pub version: String,
    pub profile: String,
    pub platform: String,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    pub max_mem_alloc_size: u64,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_constant_buffer_size: u64,
    pub profiling_timer_resolution: usize,
    pub max_compute_units: u32,
    /// Parsed from `version`; `None` if the string is malformed.
    pub cl_version: Option<ClVersion>,
}

impl DeviceProps {
    pub fn from_info(info: DeviceInfo) -> Self {
        let cl_version = ClVersion::parse(&info.version);
        Self {
            name: info.name.trim().to_string(),
            vendor: info.vendor.trim().to_string(),
            kind: info
                .class
                .map(DeviceClass::label)
                .unwrap_or("DEFAULT")
                .to_string(),
            version: info.version,
            profile: info.profile,
            platform: info.platform,
            max_work_group_size: info.max_work_group_size,
            max_work_item_sizes: info.max_work_item_sizes,
            max_mem_alloc_size: info.max_mem_alloc_size,
            global_mem_size: info.global_mem_size,
            local_mem_size: info.local_mem_size,
            max_constant_buffer_size: info.max_constant_buffer_size,
            profiling_timer_resolution: info.profiling_timer_resolution,
            max_compute_units: info.max_compute_units,
            cl_version,
        }
    }

    /// Ranking heuristic: product of the per-dimension work-item limits.
    /// A device that reports no limits has capacity 0.
    pub fn capacity(&self) -> u64 {
        if self.max_work_item_sizes.is_empty() {
            return 0;
        }
        self.max_work_item_sizes
            .iter()
            .fold(1u64, |acc, &n| acc.saturating_mul(n as u64))
    }

    pub fn supports_cl2(&self) -> bool {
        self.cl_version.is_some_and(|v| v >= ClVersion::CL2_0)
    }

    fn vendor_matches(&self, vendor: &str) -> bool {
        self.vendor.to_lowercase().contains(vendor)
    }

    /// Human-readable description, one line per group of properties.
    pub fn summary_lines(&self) -> [String; 4] {
        [
            format!(
                "OpenCL    Type:{}  Vendor:{}  Device:{}",
                self.kind, self.vendor, self.name
            ),
            format!(
                "Device Sizes   WorkGroup:{}  WorkItem:{:?}",
                self.max_work_group_size, self.max_work_item_sizes
            ),
            format!(
                "Max Mem (kB)   Global:{}  Alloc:{}  Local:{}  Constant:{}",
                self.global_mem_size / 1024,
                self.max_mem_alloc_size / 1024,
                self.local_mem_size / 1024,
                self.max_constant_buffer_size / 1024
            ),
            format!(
                "Profile (ns)   Type:{}  Resolution:{}",
                self.profile, self.profiling_timer_resolution
            ),
        ]
    }
}

/// Lower-cased vendor preference; `default` and empty map to nvidia.
pub fn normalize_vendor(vendor: &str) -> String {
    let v = vendor.trim().to_lowercase();
    if v.is_empty() || v == "default" {
        DEFAULT_VENDOR.to_string()
    } else {
        v
    }
}

/// Sort candidates best first: vendor match, then capacity descending.
/// Ties keep their enumeration order.
pub fn rank<T>(candidates: &mut [(T, DeviceProps)], vendor: &str) {
    candidates.sort_by(|(_, a), (_, b)| {
        b.vendor_matches(vendor)
            .cmp(&a.vendor_matches(vendor))
            .then_with(|| b.capacity().cmp(&a.capacity()))
    });
}

/// The selected device with its context and command queue.
///
/// Everything created against the device (buffers, kernels) holds an `Rc`
/// to this, so it lives until the last of them is dropped. Fields drop in
/// declaration order: the queue goes before the context.
pub struct DeviceContext<D: Driver> {
    queue: D::Queue,
    context: D::Context,
    device: D::Device,
    props: DeviceProps,
    queue_creation: QueueCreation,
    config: RuntimeConfig,
    sink: Box<dyn DiagnosticSink>,
    driver: D,
}

impl<D: Driver> fmt::Debug for DeviceContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.props.name)
            .field("vendor", &self.props.vendor)
            .field("queue_creation", &self.queue_creation)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> DeviceContext<D> {
    /// Select a device per `config.device` / `config.vendor` and open a
    /// context and queue on it.
    pub fn acquire(
        driver: D,
        config: RuntimeConfig,
        sink: Box<dyn DiagnosticSink>,
    ) -> ClResult<Self> {
        let kind = DeviceKind::resolve(&config.device, sink.as_ref());
        let vendor = normalize_vendor(&config.vendor);

        let platforms = driver.platforms()?;
        sink.record(&Event::PlatformsFound {
            count: platforms.len(),
        });
        let platform = platforms.first().cloned().ok_or(ClError::NoPlatformFound)?;

        let devices = driver.devices(&platform, kind.filter())?;
        sink.record(&Event::DevicesFound {
            kind: kind.to_string(),
            count: devices.len(),
        });
        if devices.is_empty() {
            return Err(ClError::NoDeviceOfRequestedKind { kind });
        }

        let mut last_failure = (
            String::from("<none>"),
            String::from("no usable device"),
        );
        let mut candidates = Vec::with_capacity(devices.len());
        for (i, device) in devices.into_iter().enumerate() {
            match driver.device_info(&device) {
                Ok(info) => candidates.push((device, DeviceProps::from_info(info))),
                Err(e) => {
                    let name = format!("#{i}");
                    sink.record(&Event::CandidateSkipped {
                        device: name.clone(),
                        reason: e.to_string(),
                    });
                    last_failure = (name, e.to_string());
                }
            }
        }
        rank(&mut candidates, &vendor);

        for (device, props) in candidates {
            let extended = props.supports_cl2() && driver.runtime_supports_cl2();
            let creation = if extended {
                QueueCreation::WithProperties
            } else {
                QueueCreation::Legacy
            };
            let opened = driver
                .create_context(&platform, &device)
                .and_then(|ctx| {
                    let queue = driver.create_queue(&ctx, &device, creation, config.profiling)?;
                    Ok((ctx, queue))
                });
            match opened {
                Ok((context, queue)) => {
                    sink.record(&Event::DeviceSelected {
                        device: props.name.clone(),
                        vendor: props.vendor.clone(),
                        extended_queue: extended,
                    });
                    for line in props.summary_lines() {
                        sink.record(&Event::DeviceProperties { line });
                    }
                    return Ok(Self {
                        queue,
                        context,
                        device,
                        props,
                        queue_creation: creation,
                        config,
                        sink,
                        driver,
                    });
                }
                Err(e) => {
                    sink.record(&Event::CandidateSkipped {
                        device: props.name.clone(),
                        reason: e.to_string(),
                    });
                    last_failure = (props.name, e.to_string());
                }
            }
        }

        let (device, reason) = last_failure;
        Err(ClError::ContextCreationFailed { device, reason })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn queue(&self) -> &D::Queue {
        &self.queue
    }

    pub fn context(&self) -> &D::Context {
        &self.context
    }

    pub fn device(&self) -> &D::Device {
        &self.device
    }

    pub fn props(&self) -> &DeviceProps {
        &self.props
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether the queue was created with the OpenCL 2.0 API.
    pub fn extended_queue(&self) -> bool {
        self.queue_creation == QueueCreation::WithProperties
    }

    /// Whether programs may be built with `-cl-std=CL2.0`.
    pub fn supports_cl2(&self) -> bool {
        self.props.supports_cl2() && self.driver.runtime_supports_cl2()
    }

    pub fn emit(&self, event: Event) {
        self.sink.record(&event);
    }

    /// Block until every queued command has completed.
    pub fn finish(&self) -> ClResult<()> {
        self.driver.finish(&self.queue)
    }
}

/// Properties of every device on the first platform, without opening a
/// context. Returns an empty list when there is no platform.
pub fn probe<D: Driver>(driver: &D) -> ClResult<Vec<DeviceProps>> {
    let Some(platform) = driver.platforms()?.into_iter().next() else {
        return Ok(Vec::new());
    };
    driver
        .devices(&platform, None)?
        .iter()
        .map(|d| driver.device_info(d).map(DeviceProps::from_info))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{NullSink, RecordingSink};
    use crate::sim::{SimDevice, SimDriver};
    use rstest::rstest;
    use std::rc::Rc;

    fn props(vendor: &str, sizes: &[usize]) -> DeviceProps {
        DeviceProps::from_info(DeviceInfo {
            name: format!("{vendor}-{sizes:?}"),
            vendor: vendor.to_string(),
            max_work_item_sizes: sizes.to_vec(),
            ..DeviceInfo::default()
        })
    }

    fn acquire(driver: SimDriver, device: &str, vendor: &str) -> ClResult<DeviceContext<SimDriver>> {
        let cfg = RuntimeConfig::default()
            .with_device(device)
            .with_vendor(vendor);
        DeviceContext::acquire(driver, cfg, Box::new(NullSink))
    }

    #[rstest]
    #[case("cpu", Some(DeviceKind::Cpu))]
    #[case("GPU", Some(DeviceKind::Gpu))]
    #[case("all", Some(DeviceKind::All))]
    #[case("Any", Some(DeviceKind::All))]
    #[case("default", Some(DeviceKind::All))]
    #[case("bogus", None)]
    fn test_parse_kind(#[case] token: &str, #[case] expected: Option<DeviceKind>) {
        assert_eq!(DeviceKind::parse(token), expected);
    }

    #[test]
    fn test_unknown_kind_warns_and_falls_back() {
        let sink = RecordingSink::new();
        assert_eq!(DeviceKind::resolve("bogus", &sink), DeviceKind::All);
        assert_eq!(sink.at_least(log::Level::Warn).len(), 1);
        assert_eq!(DeviceKind::resolve("gpu", &sink), DeviceKind::Gpu);
        assert_eq!(sink.events().len(), 1);
    }

    #[rstest]
    #[case("OpenCL 1.2 CUDA", Some((1, 2)))]
    #[case("OpenCL 2.0 AMD-APP (1800.11)", Some((2, 0)))]
    #[case("OpenCL 3.0", Some((3, 0)))]
    #[case("garbage", None)]
    fn test_parse_version(#[case] s: &str, #[case] expected: Option<(u32, u32)>) {
        let got = ClVersion::parse(s).map(|v| (v.major, v.minor));
        assert_eq!(got, expected);
    }

    #[test]
    fn test_capacity() {
        assert_eq!(props("x", &[1024, 1024, 64]).capacity(), 1024 * 1024 * 64);
        assert_eq!(props("x", &[]).capacity(), 0);
    }

    #[test]
    fn test_vendor_normalization() {
        assert_eq!(normalize_vendor("default"), "nvidia");
        assert_eq!(normalize_vendor(""), "nvidia");
        assert_eq!(normalize_vendor("AMD"), "amd");
    }

    #[test]
    fn test_rank_vendor_then_capacity_stable() {
        let mut c = vec![
            ("small-amd", props("Advanced Micro Devices", &[64, 64])),
            ("big-intel", props("Intel", &[1024, 1024])),
            ("nv-a", props("NVIDIA Corporation", &[256])),
            ("nv-b", props("NVIDIA Corporation", &[256])),
            ("big-amd", props("Advanced Micro Devices", &[1024, 1024])),
        ];
        rank(&mut c, "nvidia");
        let order: Vec<_> = c.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec!["nv-a", "nv-b", "big-intel", "big-amd", "small-amd"]);
    }

    #[test]
    fn test_no_platform() {
        let err = acquire(SimDriver::with_platforms(vec![]), "all", "default").unwrap_err();
        assert!(matches!(err, ClError::NoPlatformFound));
        assert!(err.is_setup_failure());
    }

    #[test]
    fn test_no_device_of_kind() {
        let driver = SimDriver::new(vec![SimDevice::cpu("host", "Intel")]);
        let err = acquire(driver, "gpu", "default").unwrap_err();
        assert!(matches!(
            err,
            ClError::NoDeviceOfRequestedKind {
                kind: DeviceKind::Gpu
            }
        ));
    }

    #[test]
    fn test_selects_preferred_vendor() {
        let driver = SimDriver::new(vec![
            SimDevice::gpu("radeon", "AMD"),
            SimDevice::gpu("geforce", "NVIDIA Corporation"),
        ]);
        let ctx = acquire(driver, "gpu", "default").unwrap();
        assert_eq!(ctx.props().name, "geforce");
    }

    #[test]
    fn test_same_vendor_picks_larger_work_items() {
        let driver = SimDriver::new(vec![
            SimDevice::gpu("narrow", "NVIDIA Corporation").with_work_item_sizes(vec![256, 256]),
            SimDevice::gpu("wide", "NVIDIA Corporation").with_work_item_sizes(vec![1024, 1024]),
            SimDevice::gpu("other", "AMD").with_work_item_sizes(vec![4096, 4096]),
        ]);
        let ctx = acquire(driver, "gpu", "default").unwrap();
        assert_eq!(ctx.props().name, "wide");
    }

    #[test]
    fn test_falls_back_to_next_candidate() {
        let sink = Rc::new(RecordingSink::new());
        let driver = SimDriver::new(vec![
            SimDevice::gpu("broken", "NVIDIA").failing_context(),
            SimDevice::gpu("working", "AMD"),
        ]);
        let ctx =
            DeviceContext::acquire(driver, RuntimeConfig::default(), Box::new(sink.clone()))
                .unwrap();
        assert_eq!(ctx.props().name, "working");
        let skipped = sink.count(|e| matches!(e, Event::CandidateSkipped { .. }));
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_all_candidates_fail_reports_last() {
        let driver = SimDriver::new(vec![
            SimDevice::gpu("first", "NVIDIA").failing_context(),
            SimDevice::gpu("second", "AMD").failing_context(),
        ]);
        match acquire(driver, "all", "default").unwrap_err() {
            ClError::ContextCreationFailed { device, .. } => assert_eq!(device, "second"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[rstest]
    #[case("OpenCL 2.0 sim", true, QueueCreation::WithProperties)]
    #[case("OpenCL 2.0 sim", false, QueueCreation::Legacy)]
    #[case("OpenCL 1.2 sim", true, QueueCreation::Legacy)]
    fn test_queue_creation_gated_on_version(
        #[case] version: &str,
        #[case] runtime_cl2: bool,
        #[case] expected: QueueCreation,
    ) {
        let driver = SimDriver::new(vec![SimDevice::gpu("dev", "NVIDIA").with_version(version)])
            .with_cl2_runtime(runtime_cl2);
        let probe = driver.clone();
        let ctx = acquire(driver, "all", "default").unwrap();
        assert_eq!(probe.queue_creations(), vec![expected]);
        assert_eq!(ctx.extended_queue(), expected == QueueCreation::WithProperties);
        assert_eq!(ctx.supports_cl2(), expected == QueueCreation::WithProperties);
    }

    #[test]
    fn test_selected_device_is_logged() {
        let sink = Rc::new(RecordingSink::new());
        let driver = SimDriver::new(vec![SimDevice::gpu("dev", "NVIDIA")]);
        DeviceContext::acquire(driver, RuntimeConfig::default(), Box::new(sink.clone())).unwrap();
        let lines = sink.count(|e| matches!(e, Event::DeviceProperties { .. }));
        assert_eq!(lines, 4);
        assert_eq!(sink.count(|e| matches!(e, Event::DeviceSelected { .. })), 1);
    }

    #[test]
    fn test_probe_lists_devices() {
        let driver = SimDriver::new(vec![
            SimDevice::gpu("a", "NVIDIA"),
            SimDevice::cpu("b", "Intel"),
        ]);
        let found = probe(&driver).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].kind, "CPU");
        assert!(probe(&SimDriver::with_platforms(vec![])).unwrap().is_empty());
    }
}
