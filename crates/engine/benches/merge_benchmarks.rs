//! Merge Performance Benchmarks
//!
//! Measures the cost of the main merge paths:
//! - Change computation for a unit of work with many working copies
//! - Commit of a single object, uncontended
//! - Commits from several threads on disjoint keys
//! - Distributed change-set application on a peer

use coherence_core::{Attributes, CacheKey, EntityObject, PrimaryKey, Row, Value};
use coherence_engine::testing::StaticDataSource;
use coherence_engine::{EntityDescriptor, Session};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

fn employee_descriptor() -> EntityDescriptor {
    EntityDescriptor::builder("Employee")
        .primary_key(["id"])
        .direct("id")
        .direct("name")
        .direct("salary")
        .version_locking("version")
        .build()
        .unwrap()
}

fn rows(count: i64) -> Arc<StaticDataSource> {
    let rows = Arc::new(StaticDataSource::new());
    for id in 0..count {
        let mut state = Attributes::new();
        state.insert("id".into(), Value::Int(id));
        state.insert("name".into(), Value::from(format!("employee-{}", id)));
        state.insert("salary".into(), Value::Int(100));
        state.insert("version".into(), Value::Int(1));
        rows.insert("Employee", PrimaryKey::int(id), Row::new(state));
    }
    rows
}

fn session(rows: &Arc<StaticDataSource>) -> Session {
    Session::builder()
        .descriptor(employee_descriptor())
        .data_source(Arc::clone(rows) as Arc<_>)
        .build()
        .unwrap()
}

fn key(id: i64) -> CacheKey {
    CacheKey::new("Employee", PrimaryKey::int(id))
}

/// Benchmark: change computation over many working copies
fn bench_calculate_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("calculate_changes");

    for size in [10i64, 100, 1000] {
        let rows = rows(size);
        let session = session(&rows);
        let mut uow = session.acquire_unit_of_work();
        for id in 0..size {
            let clone = uow.read_object(&key(id)).unwrap().unwrap();
            if id % 10 == 0 {
                uow.set_attribute(clone.id(), "salary", 200i64).unwrap();
            }
        }

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(uow.calculate_changes().unwrap()));
        });
    }

    group.finish();
}

/// Benchmark: single-threaded commits (no contention)
fn bench_single_commit(c: &mut Criterion) {
    let rows = rows(1);
    let session = session(&rows);

    let mut group = c.benchmark_group("single_threaded");
    group.throughput(Throughput::Elements(1));

    group.bench_function("commit_update", |b| {
        let mut salary = 0i64;
        b.iter(|| {
            let mut uow = session.acquire_unit_of_work();
            let clone = uow.read_object(&key(0)).unwrap().unwrap();
            uow.set_attribute(clone.id(), "salary", salary).unwrap();
            black_box(uow.commit().unwrap());
            salary += 1;
        });
    });

    group.bench_function("commit_new", |b| {
        let mut id = 1_000_000i64;
        b.iter(|| {
            let mut uow = session.acquire_unit_of_work();
            let mut state = Attributes::new();
            state.insert("id".into(), Value::Int(id));
            state.insert("salary".into(), Value::Int(1));
            uow.register_new_object(EntityObject::new("Employee", state))
                .unwrap();
            black_box(uow.commit().unwrap());
            id += 1;
        });
    });

    group.finish();
}

/// Benchmark: multi-threaded commits on disjoint keys
fn bench_multi_threaded_no_conflict(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_threaded_no_conflict");

    for num_threads in [2i64, 4, 8] {
        let rows = rows(num_threads);
        let session = session(&rows);
        group.throughput(Throughput::Elements(num_threads as u64 * 100));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|id| {
                            let session = session.clone();
                            thread::spawn(move || {
                                for salary in 0..100i64 {
                                    let mut uow = session.acquire_unit_of_work();
                                    let clone = uow.read_object(&key(id)).unwrap().unwrap();
                                    uow.set_attribute(clone.id(), "salary", salary).unwrap();
                                    uow.commit().unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: applying a peer's change set
fn bench_distributed_apply(c: &mut Criterion) {
    let rows = rows(100);
    let origin = session(&rows);
    let peer = session(&rows);
    for id in 0..100 {
        peer.read_original(&key(id)).unwrap();
    }

    let mut uow = origin.acquire_unit_of_work();
    for id in 0..100 {
        let clone = uow.read_object(&key(id)).unwrap().unwrap();
        uow.set_attribute(clone.id(), "salary", 500i64).unwrap();
    }
    uow.commit().unwrap();
    let bytes = uow.change_set().for_distribution().to_bytes().unwrap();

    let mut group = c.benchmark_group("distributed");
    group.throughput(Throughput::Elements(100));
    group.bench_function("apply_100_objects", |b| {
        b.iter(|| {
            // After the first pass every object is already current.
            black_box(peer.apply_distributed_bytes(&bytes).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_calculate_changes,
    bench_single_commit,
    bench_multi_threaded_no_conflict,
    bench_distributed_apply,
);

criterion_main!(benches);
