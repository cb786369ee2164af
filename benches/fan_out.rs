//! Benchmarks for graph dispatch overhead

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use heteroflow::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn executor() -> Executor {
    Executor::new(Config::builder().enable_telemetry(false).build().unwrap()).unwrap()
}

fn fan_out_graph(width: usize, sum: &Arc<AtomicU64>) -> Taskflow {
    let taskflow = Taskflow::new();
    let root = taskflow.emplace(|| {}).unwrap();
    let sink = taskflow.emplace(|| {}).unwrap();

    for i in 0..width {
        let sum = sum.clone();
        let leaf = taskflow
            .emplace(move || {
                sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
            })
            .unwrap();
        leaf.succeed([&root]).unwrap().precede([&sink]).unwrap();
    }

    taskflow
}

fn chain_graph(length: usize) -> Taskflow {
    let taskflow = Taskflow::new();
    let mut prev: Option<Task> = None;
    for _ in 0..length {
        let task = taskflow.emplace(|| {}).unwrap();
        if let Some(prev) = &prev {
            prev.precede([&task]).unwrap();
        }
        prev = Some(task);
    }
    taskflow
}

fn bench_fan_out(c: &mut Criterion) {
    let executor = executor();
    let mut group = c.benchmark_group("fan_out");

    for width in [16usize, 256, 4096] {
        let sum = Arc::new(AtomicU64::new(0));
        let taskflow = fan_out_graph(width, &sum);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| executor.run(&taskflow).unwrap().wait().unwrap());
        });
    }

    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let executor = executor();
    let mut group = c.benchmark_group("chain");

    for length in [16usize, 256] {
        let taskflow = chain_graph(length);
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| executor.run(&taskflow).unwrap().wait().unwrap());
        });
    }

    group.finish();
}

fn bench_device_replay(c: &mut Criterion) {
    const N: usize = 1 << 14;

    let executor = executor();
    let taskflow = Taskflow::new();
    let data = Buffer::<f32>::on_device(DeviceId(0), N);
    taskflow
        .emplace_device(move |flow| {
            let zero = flow.zero(&data, N)?;
            let d = data.clone();
            let kernel = flow.kernel(LaunchGeometry::for_elements(N, 256), move |ctx| {
                let i = ctx.global_x();
                if i < N {
                    d.set(i, d.get(i) + 1.0);
                }
            })?;
            zero.precede([&kernel])?;
            Ok(())
        })
        .unwrap();

    // first run pays for instantiation
    executor.run(&taskflow).unwrap().wait().unwrap();

    c.bench_function("device_replay", |b| {
        b.iter(|| executor.run(&taskflow).unwrap().wait().unwrap());
    });
}

criterion_group!(benches, bench_fan_out, bench_chain, bench_device_replay);
criterion_main!(benches);
