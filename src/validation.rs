//! End-to-end scenarios across device selection, buffers and kernels, run on
//! the simulated driver.

use std::rc::Rc;

use log::Level;

use crate::sim::{SimDevice, SimDriver};
use crate::{
    ArgType, ArgValue, DefineValue, DeviceKind, ErrorKind, Event, KernelState, RecordingSink,
    Runtime, RuntimeConfig, Signature,
};

const ADD: &str = "__kernel void add(__global const int* a, __global const int* b,
                                     __global int* out, int n) {
    int i = get_global_id(0);
    if (i < n) out[i] = a[i] + b[i];
}";

fn add_driver() -> SimDriver {
    let driver = SimDriver::new(vec![
        SimDevice::cpu("sim-cpu", "Intel"),
        SimDevice::gpu("sim-gpu", "NVIDIA Corporation"),
    ]);
    driver.register_kernel("add", |launch| {
        let n = launch.scalar::<i32>(3)? as usize;
        let a: Vec<i32> = launch.read(0)?;
        let b: Vec<i32> = launch.read(1)?;
        let out: Vec<i32> = a.iter().zip(&b).take(n).map(|(x, y)| x + y).collect();
        launch.write(2, &out)
    });
    driver
}

fn add_signature() -> Signature {
    Signature::default()
        .named("a", ArgType::Mem)
        .named("b", ArgType::Mem)
        .named("out", ArgType::Mem)
        .named("n", ArgType::Int)
}

#[test]
fn test_elementwise_add() {
    let rt = Runtime::simulated(add_driver()).unwrap();
    let a = rt.create_buffer_from(&[1i32, 1, 1], "a").unwrap();
    let b = rt.create_buffer_from(&[2i32, 2, 2], "b").unwrap();
    let out = rt.create_buffer(3 * 4, "out").unwrap();

    let mut k = rt.create_kernel_from_source(ADD, "add", add_signature());
    k.run_with(
        &[3],
        None,
        [
            ArgValue::from(&a),
            ArgValue::from(&b),
            ArgValue::from(&out),
            ArgValue::from(3i32),
        ],
    )
    .unwrap();
    assert_eq!(out.read::<i32>().unwrap(), vec![3, 3, 3]);
    assert_eq!(rt.props().name, "sim-gpu");
}

#[test]
fn test_bogus_kind_falls_back_to_all() {
    let sink = Rc::new(RecordingSink::new());
    let cfg = RuntimeConfig::default().with_device("bogus");
    let rt = Runtime::acquire(add_driver(), cfg, sink.clone()).unwrap();

    let warnings = sink.at_least(Level::Warn);
    assert_eq!(warnings.len(), 1);
    match &warnings[0] {
        Event::DeviceKindFallback { requested, using } => {
            assert_eq!(requested, "bogus");
            assert_eq!(using, &DeviceKind::All.to_string());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        sink.count(|e| matches!(e, Event::DevicesFound { count: 2, .. })),
        1
    );
    assert!(!rt.props().name.is_empty());
}

#[test]
fn test_failed_run_leaves_kernel_runnable() {
    let driver = add_driver();
    let rt = Runtime::simulated(driver.clone()).unwrap();
    let a = rt.create_buffer_from(&[4i32, 5], "a").unwrap();
    let b = rt.create_buffer_from(&[1i32, 1], "b").unwrap();
    let out = rt.create_buffer(8, "out").unwrap();

    let mut k = rt.create_kernel_from_source(ADD, "add", add_signature().define("UNUSED"));
    k.set_positional([
        ArgValue::from(&a),
        ArgValue::from(&b),
        ArgValue::from(&out),
        ArgValue::from(2i32),
    ])
    .unwrap();
    assert_eq!(k.run(&[2], None).unwrap_err().kind(), ErrorKind::MissingDefine);
    assert_eq!(driver.stats().builds, 0);

    k.define("UNUSED", DefineValue::NoValue);
    k.run(&[2], None).unwrap();
    assert_eq!(k.state(), KernelState::Compiled);
    assert_eq!(out.read::<i32>().unwrap(), vec![5, 6]);
}

#[test]
fn test_chained_kernels_share_buffers() {
    let driver = add_driver();
    let rt = Runtime::simulated(driver.clone()).unwrap();
    let a = rt.create_buffer_from(&[1i32; 4], "a").unwrap();
    let acc = rt.create_buffer_from(&[0i32; 4], "acc").unwrap();

    let mut k = rt.create_kernel_from_source(ADD, "add", add_signature());
    k.set_positional([
        ArgValue::from(&a),
        ArgValue::from(&acc),
        ArgValue::from(&acc),
        ArgValue::from(4i32),
    ])
    .unwrap();
    for _ in 0..5 {
        k.run(&[4], None).unwrap();
    }
    assert_eq!(acc.read::<i32>().unwrap(), vec![5; 4]);
    assert_eq!(driver.stats().builds, 1);
    assert_eq!(driver.stats().arg_binds, 4);
    assert_eq!(k.runtime_stats().runs, 5);

    let snapshot = rt.create_buffer(8, "snapshot").unwrap();
    acc.copy_into(&snapshot).unwrap();
    assert_eq!(snapshot.read::<i32>().unwrap(), vec![5, 5]);
}

#[test]
fn test_env_config_drives_selection_and_build() {
    let env = |key: &str| match key {
        "CLRUN_DEVICE" => Some("cpu".to_string()),
        "CLRUN_FAST_MATH" => Some("off".to_string()),
        "CLRUN_BUILD_OPTIONS" => Some("-DEXTRA".to_string()),
        _ => None,
    };
    let driver = add_driver();
    let rt = Runtime::acquire(
        driver.clone(),
        RuntimeConfig::from_env_with(env),
        crate::NullSink,
    )
    .unwrap();
    assert_eq!(rt.props().name, "sim-cpu");

    let kernels = rt.compile(ADD, "add").unwrap();
    assert_eq!(kernels.len(), 1);
    assert_eq!(driver.last_build_options().as_deref(), Some("-DEXTRA"));
}
