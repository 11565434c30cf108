//! Replay and claim benchmarks
//!
//! Measures the two hot paths of an orchestration cycle: replaying a history
//! of completed tasks through a program, and write-once task claims under
//! contention.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use durable_engine::engine::{interpret, WorkflowExecutor, WorkflowRegistry};
use durable_engine::persistence::{InMemoryTaskStore, TaskStore};
use durable_engine::workflow::{EventKind, WorkflowEvent};

/// Program that runs `count` tasks one after another
fn sequential_registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register_fn("sequential", |ctx, input| async move {
        let count = input.as_u64().unwrap_or(0);
        let mut total = 0;
        for i in 0..count {
            total += ctx.task("step", json!(i)).await?.as_u64().unwrap_or(0);
        }
        Ok(json!(total))
    });
    registry
}

/// Full history of a finished `sequential` run
fn completed_history(count: u32) -> Vec<WorkflowEvent> {
    let mut history = vec![WorkflowEvent::new(EventKind::WorkflowStarted {
        execution_id: "sequential/bench".into(),
        workflow_name: "sequential".into(),
        input: json!(count),
        parent: None,
    })];
    for seq in 0..count {
        history.push(WorkflowEvent::new(EventKind::TaskScheduled {
            seq,
            name: "step".into(),
        }));
        history.push(WorkflowEvent::new(EventKind::TaskSucceeded {
            seq,
            result: json!(1),
        }));
    }
    history
}

/// Benchmark replaying a complete history
fn bench_replay(c: &mut Criterion) {
    let registry = sequential_registry();
    let Some(program) = registry.get("sequential") else {
        return;
    };

    let mut group = c.benchmark_group("replay/sequential");
    for count in [10u32, 100, 500] {
        let history = completed_history(count);
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::new("tasks", count), &history, |b, history| {
            b.iter(|| interpret(program.as_ref(), history).unwrap());
        });
    }
    group.finish();
}

/// Benchmark a cycle that appends one completion to a long history
fn bench_executor_cycle(c: &mut Criterion) {
    let registry = sequential_registry();
    let Some(program) = registry.get("sequential") else {
        return;
    };

    let mut group = c.benchmark_group("replay/executor_cycle");
    for count in [10u32, 100] {
        // History stops one completion short of the end
        let mut history = completed_history(count);
        let last = history.pop().unwrap();
        group.bench_with_input(BenchmarkId::new("tasks", count), &count, |b, _| {
            b.iter(|| {
                let mut executor = WorkflowExecutor::new(program.clone(), history.clone());
                executor.run(vec![last.clone()]).unwrap()
            });
        });
    }
    group.finish();
}

/// Benchmark uncontended claims of distinct tasks
fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));
    group.bench_function("claim", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = InMemoryTaskStore::new();
            let start = Instant::now();
            for seq in 0..iters {
                store.claim("bench/1", seq as u32, 0).await.unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

/// Benchmark workers racing for the same claims
fn bench_claim_contended(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/contended");
    group.sample_size(20);

    for workers in [2usize, 4, 8] {
        let task_count = 1000u32;
        group.throughput(Throughput::Elements(u64::from(task_count)));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        let store = Arc::new(InMemoryTaskStore::new());
                        let start = Instant::now();

                        let handles: Vec<_> = (0..workers)
                            .map(|_| {
                                let store = store.clone();
                                tokio::spawn(async move {
                                    let mut granted = 0u32;
                                    for seq in 0..task_count {
                                        if store.claim("bench/1", seq, 0).await.unwrap() {
                                            granted += 1;
                                        }
                                    }
                                    granted
                                })
                            })
                            .collect();

                        let mut granted = 0;
                        for handle in handles {
                            granted += handle.await.unwrap();
                        }
                        assert_eq!(granted, task_count);
                        elapsed += start.elapsed();
                    }
                    elapsed
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_replay,
    bench_executor_cycle,
    bench_claim_single,
    bench_claim_contended
);
criterion_main!(benches);
