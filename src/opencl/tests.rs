use super::*;
use crate::device::probe;
use crate::{ArgType, ArgValue, ErrorKind, Runtime, RuntimeConfig};

// Tests that need a device return early when the machine has none.
fn runtime() -> Option<Runtime<OpenClDriver>> {
    match Runtime::opencl(RuntimeConfig::default()) {
        Ok(rt) => Some(rt),
        Err(e) => {
            assert!(e.is_setup_failure(), "unexpected error {e:?}");
            None
        }
    }
}

#[test]
fn test_class_of_prefers_gpu_bit() {
    assert_eq!(class_of(CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_DEFAULT), DeviceClass::Gpu);
    assert_eq!(class_of(CL_DEVICE_TYPE_CPU), DeviceClass::Cpu);
    assert_eq!(class_of(CL_DEVICE_TYPE_ACCELERATOR), DeviceClass::Accelerator);
    assert_eq!(class_of(0), DeviceClass::Other);
}

#[test]
fn test_type_mask() {
    assert_eq!(type_mask(None), CL_DEVICE_TYPE_ALL);
    assert_eq!(type_mask(Some(DeviceClass::Gpu)), CL_DEVICE_TYPE_GPU);
}

#[test]
fn test_probe_does_not_panic() {
    let devices = probe(&OpenClDriver::new()).unwrap_or_default();
    for d in &devices {
        assert!(!d.name.is_empty());
    }
}

#[test]
fn test_device_selected() {
    let Some(rt) = runtime() else { return };
    assert!(!rt.props().name.is_empty());
    assert!(rt.props().max_work_group_size > 0);
}

#[test]
fn test_buffer_round_trip() {
    let Some(rt) = runtime() else { return };
    let data: Vec<u32> = (0..1024).collect();
    let buf = rt.create_buffer_from(&data, "data").unwrap();
    assert_eq!(buf.read::<u32>().unwrap(), data);

    let copy = rt.create_buffer(2048, "copy").unwrap();
    buf.copy_into(&copy).unwrap();
    assert_eq!(copy.read::<u32>().unwrap(), data[..512].to_vec());
}

#[test]
fn test_add_kernel() {
    let Some(rt) = runtime() else { return };
    let a = rt.create_buffer_from(&[1i32, 1, 1], "a").unwrap();
    let b = rt.create_buffer_from(&[2i32, 2, 2], "b").unwrap();
    let out = rt.create_buffer(12, "out").unwrap();
    let mut k = rt.create_kernel_from_source(
        "__kernel void add(__global const int* a, __global const int* b,
                           __global int* out, int n) {
            int i = get_global_id(0);
            if (i < n) out[i] = a[i] + b[i] * SCALE;
        }",
        "add",
        &[ArgType::Mem, ArgType::Mem, ArgType::Mem, ArgType::Int],
    );
    k.define("SCALE", 1);
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

    k.define("SCALE", 2);
    k.run(&[3], None).unwrap();
    assert_eq!(out.read::<i32>().unwrap(), vec![5, 5, 5]);
}

#[test]
fn test_build_failure_carries_log() {
    let Some(rt) = runtime() else { return };
    let err = rt
        .compile("__kernel void broken( {", "broken")
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildFailed);
}
