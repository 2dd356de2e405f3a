//! Reclamation hot-path benchmarks.

use std::mem;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use quiesce_core::{Ebr, Entry, Gc, Qsbr};

fn bench_ebr_enter_exit(c: &mut Criterion) {
    let ebr = Ebr::new();
    ebr.register().expect("register");

    c.bench_function("ebr_enter_exit", |b| {
        b.iter(|| {
            ebr.enter();
            criterion::black_box(&ebr);
            ebr.exit();
        });
    });

    ebr.unregister();
}

fn bench_ebr_sync_uncontended(c: &mut Criterion) {
    let ebr = Ebr::new();
    ebr.register().expect("register");

    c.bench_function("ebr_sync_uncontended", |b| {
        b.iter(|| criterion::black_box(ebr.sync()));
    });

    ebr.unregister();
}

fn bench_qsbr_checkpoint(c: &mut Criterion) {
    let qsbr = Qsbr::new();
    qsbr.register().expect("register");

    c.bench_function("qsbr_checkpoint", |b| {
        b.iter(|| {
            qsbr.checkpoint();
            criterion::black_box(&qsbr);
        });
    });

    qsbr.unregister();
}

struct Node {
    entry: Entry,
}

fn bench_gc_retire_drain(c: &mut Criterion) {
    let batch_sizes: &[usize] = &[16, 256, 4096];
    let mut group = c.benchmark_group("gc_retire_drain");

    for &size in batch_sizes {
        group.bench_with_input(BenchmarkId::new("boxed", size), &size, |b, &n| {
            let gc: Gc<Node> = Gc::new(mem::offset_of!(Node, entry));
            gc.register().expect("register");
            b.iter(|| {
                for _ in 0..n {
                    let obj = Box::into_raw(Box::new(Node {
                        entry: Entry::new(),
                    }));
                    // SAFETY: freshly boxed, never shared, retired once.
                    unsafe { gc.limbo(obj) };
                }
                gc.full(Duration::from_millis(1));
            });
            gc.unregister();
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_ebr_enter_exit,
    bench_ebr_sync_uncontended,
    bench_qsbr_checkpoint,
    bench_gc_retire_drain
);
criterion_main!(benches);
