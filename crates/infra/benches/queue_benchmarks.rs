use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::time::Duration;

use fintrack_core::QueueName;
use fintrack_infra::idempotency::RequestFingerprint;
use fintrack_infra::jobs::{InMemoryQueueStore, Job, QueueStore, RetryPolicy};
use serde_json::json;
use tokio::runtime::Runtime;

const LEASE: Duration = Duration::from_secs(30);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn queue() -> QueueName {
    QueueName::from_static("bench")
}

/// Enqueue → claim → complete for one job at a time.
fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryQueueStore::new();

    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_claim_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let job = Job::new(queue(), json!({"action": "login", "actorId": "u1"}));
                store.enqueue(job).await.unwrap();
                let claimed = store.claim(&queue(), LEASE).await.unwrap().unwrap();
                black_box(store.complete(&claimed).await.unwrap());
            })
        })
    });
    group.finish();
}

/// Claim latency with a backlog of waiting jobs.
fn bench_claim_with_backlog(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_with_backlog");

    for backlog in [10usize, 100, 1_000] {
        let store = InMemoryQueueStore::new();
        rt.block_on(async {
            for i in 0..backlog {
                store.enqueue(Job::new(queue(), json!({"n": i}))).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::new("claim_then_retry", backlog), &backlog, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let claimed = store.claim(&queue(), LEASE).await.unwrap().unwrap();
                    // Back to waiting so the backlog size stays constant.
                    black_box(store.retry(&claimed, "bench", Duration::ZERO).await.unwrap());
                })
            })
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    c.bench_function("retry_delay_for_attempt", |b| {
        b.iter(|| black_box(policy.delay_for_attempt(black_box(4))))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_fingerprint");
    for size in [128usize, 4_096, 65_536] {
        let body = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| black_box(RequestFingerprint::compute("POST", "/audit-events", body)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_job_lifecycle,
    bench_claim_with_backlog,
    bench_backoff,
    bench_fingerprint
);
criterion_main!(benches);
