//! Benchmarks for dispatch and allocation overhead

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use veda_grid::prelude::*;

const SAXPY: &str = r#"
    @group(0) @binding(0) var<storage, read> x: array<f32>;
    @group(0) @binding(1) var<storage, read_write> y: array<f32>;

    @compute @workgroup_size(GROUP_SIZE_X, GROUP_SIZE_Y, GROUP_SIZE_Z)
    fn saxpy(@builtin(global_invocation_id) id: vec3<u32>) {
        if (all(id < GRID_SIZE)) {
            y[id.x] = 2.0 * x[id.x] + y[id.x];
        }
    }
"#;

fn runtime() -> Runtime<HostDevice> {
    let rt = Runtime::host(Config::default()).unwrap();
    rt.device().register_kernel("saxpy", |inv, args| {
        let i = inv.position[0] as usize;
        let v = 2.0 * args.load::<f32>(0, i) + args.load::<f32>(1, i);
        args.store(1, i, v);
    });
    rt
}

fn bench_empty_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let kernel = rt.compile_kernel(SAXPY, "saxpy").unwrap();
    let (x, _) = rt.new_buffer_1d::<f32>(1).unwrap();
    let (y, _) = rt.new_buffer_1d::<f32>(1).unwrap();

    c.bench_function("dispatch_single_item", |b| {
        b.iter(|| rt.dispatch(kernel, Grid::linear(black_box(1)), &[x, y]).unwrap());
    });
}

fn bench_saxpy(c: &mut Criterion) {
    let rt = runtime();
    let kernel = rt.compile_kernel(SAXPY, "saxpy").unwrap();
    let mut group = c.benchmark_group("saxpy");

    for size in [1_000i64, 100_000, 1_000_000] {
        let (x, _) = rt.new_buffer_1d::<f32>(size).unwrap();
        let (y, _) = rt.new_buffer_1d::<f32>(size).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| rt.dispatch(kernel, Grid::linear(size), &[x, y]).unwrap());
        });
    }

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("allocate_2d_64x64", |b| {
        b.iter(|| black_box(rt.new_buffer_2d::<f32>(64, 64).unwrap()));
    });
}

criterion_group!(benches, bench_empty_dispatch, bench_saxpy, bench_allocation);
criterion_main!(benches);
