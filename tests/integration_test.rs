use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veda_grid::prelude::*;
use veda_grid::DeviceError;

const TRANSFER: &str = r#"
    @group(0) @binding(0) var<storage, read> input: array<f32>;
    @group(0) @binding(1) var<storage, read_write> result: array<f32>;

    @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
    fn transfer(@builtin(global_invocation_id) id: vec3<u32>) {
        if (all(id < GRID_SIZE)) {
            result[id.x] = input[id.x];
        }
    }
"#;

const FILL: &str = r#"
    @group(0) @binding(0) var<storage, read_write> data: array<u32>;

    @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
    fn fill(@builtin(global_invocation_id) id: vec3<u32>) {}

    @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
    fn count(@builtin(global_invocation_id) id: vec3<u32>) {}
"#;

fn runtime() -> Runtime<HostDevice> {
    let rt = Runtime::host(Config::default()).unwrap();
    rt.device().register_kernel("transfer", |inv, args| {
        let i = inv.position[0] as usize;
        args.store(1, i, args.load::<f32>(0, i));
    });
    rt.device().register_kernel("fill", |inv, args| {
        args.store(0, inv.linear_index() as usize, inv.linear_index() as u32);
    });
    rt
}

#[test]
fn test_handle_validity() {
    for raw in 1..100 {
        assert!(KernelHandle::from_raw(raw).is_valid());
    }
    for raw in -100..=0 {
        assert!(!BufferHandle::from_raw(raw).is_valid());
    }
    assert!(KernelHandle::from_raw(i64::MAX).is_valid());
    assert!(!KernelHandle::from_raw(i64::MIN).is_valid());
}

#[test]
fn test_end_to_end_transfer() {
    let rt = runtime();
    let kernel = rt.compile_kernel(TRANSFER, "transfer").unwrap();
    assert_eq!(rt.kernel_name(kernel), "transfer");

    let (input, input_view) = rt.new_buffer_1d::<f32>(100_000).unwrap();
    let (output, output_view) = rt.new_buffer_1d::<f32>(100_000).unwrap();
    assert!(input.is_valid() && output.is_valid());

    for (i, v) in input_view.write().iter_mut().enumerate() {
        *v = (i + 1) as f32;
    }
    rt.dispatch(kernel, Grid::new(100_000, 0, 0), &[input, output])
        .unwrap();
    assert_eq!(*output_view.read(), *input_view.read());

    // New input, same kernel and buffers
    for (i, v) in input_view.write().iter_mut().enumerate() {
        *v = (i * 2) as f32 - 7.5;
    }
    rt.dispatch(kernel, Grid::new(100_000, 0, 0), &[input, output])
        .unwrap();

    let out = output_view.read();
    for i in 0..100_000 {
        assert_eq!(out[i], (i * 2) as f32 - 7.5);
    }
}

#[test]
fn test_unknown_kernel_checked_before_buffers() {
    let rt = runtime();

    let err = rt
        .dispatch(
            KernelHandle::from_raw(42),
            Grid::linear(1),
            &[BufferHandle::from_raw(7)],
        )
        .unwrap_err();
    assert!(matches!(err, Error::FunctionNotFound(42)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = rt
        .dispatch(KernelHandle::INVALID, Grid::linear(1), &[])
        .unwrap_err();
    assert!(matches!(err, Error::FunctionNotFound(0)));
}

#[test]
fn test_missing_buffer_reports_position() {
    let rt = runtime();
    let kernel = rt.compile_kernel(TRANSFER, "transfer").unwrap();
    let (input, _) = rt.new_buffer_1d::<f32>(8).unwrap();

    let err = rt
        .dispatch(kernel, Grid::linear(8), &[input, BufferHandle::from_raw(2)])
        .unwrap_err();
    match err {
        Error::BufferNotFound {
            position,
            total,
            handle,
        } => {
            assert_eq!((position, total, handle), (2, 2, 2));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_degenerate_grid_runs_once() {
    let rt = runtime();
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    rt.device().register_kernel("count", move |inv, _| {
        assert_eq!(inv.position, [0, 0, 0]);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let kernel = rt.compile_kernel(FILL, "count").unwrap();
    rt.dispatch(kernel, Grid::new(-1, -1, -1), &[]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    rt.dispatch(kernel, Grid::new(0, 0, 0), &[]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_non_uniform_grid() {
    let rt = runtime();
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    rt.device().register_kernel("count", move |_, _| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let kernel = rt.compile_kernel(FILL, "count").unwrap();
    rt.dispatch(kernel, Grid::new(33, 7, 3), &[]).unwrap();
    assert_eq!(calls.load(Ordering::Relaxed), 33 * 7 * 3);
}

#[test]
fn test_2d_round_trip() {
    let rt = runtime();
    let (_, view) = rt.new_buffer_2d::<i64>(40, 25).unwrap();
    let f = |i: usize, j: usize| (i * 1000 + j) as i64 - 500;

    {
        let mut rows = view.write();
        for i in 0..40 {
            for j in 0..25 {
                rows[i][j] = f(i, j);
            }
        }
    }

    let rows = view.read();
    let nested = rows.nested();
    assert_eq!(nested.len(), 40);
    for (i, row) in nested.iter().enumerate() {
        assert_eq!(row.len(), 25);
        for (j, &v) in row.iter().enumerate() {
            assert_eq!(v, f(i, j));
        }
    }
    assert_eq!(rows.as_flat().len(), 1000);
}

#[test]
fn test_kernel_writes_3d_buffer() {
    let rt = runtime();
    let kernel = rt.compile_kernel(FILL, "fill").unwrap();
    let (handle, view) = rt.new_buffer_3d::<u32>(3, 4, 5).unwrap();

    // x covers the innermost dimension
    rt.dispatch(kernel, Grid::new(5, 4, 3), &[handle]).unwrap();

    let planes = view.read();
    for l in 0..3 {
        for r in 0..4 {
            for c in 0..5 {
                assert_eq!(planes[(l, r, c)], (l * 20 + r * 5 + c) as u32);
            }
        }
    }
    assert_eq!(planes.nested()[2][3], &[55, 56, 57, 58, 59][..]);
}

#[test]
fn test_fresh_buffers_are_default() {
    let rt = runtime();
    let (_, floats) = rt.new_buffer_1d::<f64>(64).unwrap();
    assert!(floats.read().iter().all(|&v| v == f64::default()));

    let (_, bytes) = rt.new_buffer_2d::<i8>(3, 3).unwrap();
    assert!(bytes.read().as_flat().iter().all(|&v| v == 0));
}

#[test]
fn test_invalid_allocations() {
    let rt = runtime();

    let cases = [
        rt.new_buffer_1d::<f32>(0).map(|(h, _)| h),
        rt.new_buffer_1d::<f32>(-1).map(|(h, _)| h),
        rt.new_buffer_2d::<f32>(3, 0).map(|(h, _)| h),
        rt.new_buffer_3d::<f32>(1, -2, 1).map(|(h, _)| h),
    ];
    for result in cases {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions(_)), "{:?}", err);
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
    assert_eq!(rt.buffer_count(), 0);

    // Handles keep counting from 1
    let (handle, _) = rt.new_buffer_1d::<f32>(1).unwrap();
    assert_eq!(handle.raw(), 1);
}

#[test]
fn test_allocation_limit() {
    let config = Config::builder().max_allocation_bytes(1024).build().unwrap();
    let rt = Runtime::host(config).unwrap();

    assert!(rt.new_buffer_1d::<u32>(256).is_ok());
    let err = rt.new_buffer_1d::<u32>(257).unwrap_err();
    assert!(matches!(err, Error::AllocationFailed(_)));
    assert_eq!(err.kind(), ErrorKind::BackendFailure);
}

#[test]
fn test_compile_errors() {
    let rt = runtime();

    assert!(matches!(rt.compile_kernel("", ""), Err(Error::MissingSource)));
    assert!(matches!(rt.compile_kernel("x", ""), Err(Error::MissingEntryPoint)));
    assert!(matches!(
        rt.compile_kernel(TRANSFER, "not_there"),
        Err(Error::EntryPointNotFound(ref name)) if name == "not_there"
    ));
    assert!(matches!(
        rt.compile_kernel("fn broken( {", "broken"),
        Err(Error::CompileFailed(_))
    ));
    assert!(matches!(
        rt.compile_kernel(TRANSFER.replace("transfer", "other").as_str(), "other"),
        Err(Error::PipelineFailed(_))
    ));

    assert_eq!(rt.kernel_count(), 0);
    assert_eq!(rt.kernel_name(KernelHandle::from_raw(1)), "");
}

#[test]
fn test_same_buffer_bound_twice() {
    let rt = runtime();
    rt.device().register_kernel("count", |inv, args| {
        let i = inv.position[0] as usize;
        args.store(1, i, args.load::<u32>(0, i) + 1);
    });
    let kernel = rt.compile_kernel(FILL, "count").unwrap();
    let (handle, view) = rt.new_buffer_1d::<u32>(100).unwrap();

    for _ in 0..3 {
        rt.dispatch(kernel, Grid::linear(100), &[handle, handle])
            .unwrap();
    }
    assert!(view.read().iter().all(|&v| v == 3));
}

#[test]
fn test_too_many_bindings() {
    let rt = runtime();
    let kernel = rt.compile_kernel(FILL, "fill").unwrap();
    let handles: Vec<BufferHandle> = (0..32)
        .map(|_| rt.new_buffer_1d::<u8>(4).unwrap().0)
        .collect();

    let err = rt.dispatch(kernel, Grid::linear(1), &handles).unwrap_err();
    assert!(matches!(err, Error::DispatchFailed(DeviceError::Encoder(_))));

    rt.dispatch(kernel, Grid::linear(1), &handles[..31]).unwrap();
}

#[test]
fn test_kernel_panic_releases_buffers() {
    let rt = runtime();
    rt.device().register_kernel("count", |inv, _| {
        if inv.position[0] == 3 {
            panic!("bad index");
        }
    });
    let kernel = rt.compile_kernel(FILL, "count").unwrap();
    let (handle, view) = rt.new_buffer_1d::<u32>(8).unwrap();

    let err = rt.dispatch(kernel, Grid::linear(8), &[handle]).unwrap_err();
    assert!(matches!(err, Error::DispatchFailed(DeviceError::Execution(_))));
    assert!(err.to_string().contains("bad index"));

    // Locks are free again
    view.write()[0] = 1;
    assert_eq!(view.read()[0], 1);
}

#[test]
fn test_dispatch_fails_while_view_is_held() {
    let config = Config::builder()
        .buffer_lock_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    let rt = Runtime::host(config).unwrap();
    rt.device().register_kernel("fill", |inv, args| {
        args.store(0, inv.linear_index() as usize, 7u32);
    });
    let kernel = rt.compile_kernel(FILL, "fill").unwrap();
    let (other, _) = rt.new_buffer_1d::<u32>(4).unwrap();
    let (handle, view) = rt.new_buffer_1d::<u32>(4).unwrap();

    {
        let _guard = view.read();
        let err = rt
            .dispatch(kernel, Grid::linear(4), &[other, handle])
            .unwrap_err();
        match &err {
            Error::DispatchFailed(DeviceError::CommandBuffer(msg)) => {
                assert!(msg.contains("buffer 2 is borrowed by the host"), "{}", msg);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
    {
        let _guard = view.write();
        assert!(rt.dispatch(kernel, Grid::linear(4), &[handle]).is_err());
    }

    // Nothing ran and every lock was released
    assert!(view.read().iter().all(|&v| v == 0));
    rt.dispatch(kernel, Grid::linear(4), &[other, handle]).unwrap();
    assert!(view.read().iter().all(|&v| v == 7));
}
