//! Benchmarks for the execution state store.

use cascade::state::{ExecutionStateStore, StateUpdate};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn state_benchmark(c: &mut Criterion) {
    let store = ExecutionStateStore::new();
    let ticket = store
        .begin_run("bench", Some("personas"), 100)
        .unwrap_or_else(|e| panic!("begin_run failed: {e}"));

    c.bench_function("apply_for_run", |b| {
        let mut current = 0;
        b.iter(|| {
            current += 1;
            store.apply_for_run(
                &ticket,
                black_box(StateUpdate::new().progress(current, 100).log("persona done")),
            )
        });
    });

    c.bench_function("get", |b| b.iter(|| black_box(store.get("bench"))));
}

criterion_group!(benches, state_benchmark);
criterion_main!(benches);
