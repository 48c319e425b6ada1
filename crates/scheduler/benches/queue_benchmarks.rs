use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jobforge_core::{Job, JobId, JobPayload, JobPriority, JobStatus, UserId};
use jobforge_scheduler::{JobFilter, JobStore, PriorityQueue};

const PRIORITIES: [JobPriority; 4] = [
    JobPriority::Low,
    JobPriority::Normal,
    JobPriority::High,
    JobPriority::Critical,
];

fn filled_queue(size: usize) -> (PriorityQueue, Vec<JobId>) {
    let mut queue = PriorityQueue::new();
    let ids: Vec<JobId> = (0..size).map(|_| JobId::new()).collect();
    for (n, id) in ids.iter().enumerate() {
        queue.enqueue(*id, PRIORITIES[n % PRIORITIES.len()]);
    }
    (queue, ids)
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue_dequeue");

    for size in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("drain", size), size, |b, &size| {
            b.iter_batched(
                || filled_queue(size).0,
                |mut queue| {
                    while let Some(id) = queue.dequeue_next() {
                        black_box(id);
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_cancel_from_middle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_remove");

    for size in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("remove_middle", size), size, |b, &size| {
            b.iter_batched(
                || filled_queue(size),
                |(mut queue, ids)| black_box(queue.remove(ids[size / 2])),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_store_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list");
    group.sample_size(200);

    let store = JobStore::new();
    let owner = UserId::new();
    for n in 0..5_000 {
        let created_by = if n % 10 == 0 { owner } else { UserId::new() };
        let job = Job::new(format!("job {n}"), JobPayload::echo("bench"), created_by);
        let _ = store.insert(job);
    }

    group.bench_function("all_newest_first", |b| {
        b.iter(|| black_box(store.list(&JobFilter::new())));
    });
    group.bench_function("by_owner_limited", |b| {
        let filter = JobFilter::new()
            .with_created_by(owner)
            .with_status(JobStatus::Pending)
            .with_limit(50);
        b.iter(|| black_box(store.list(&filter)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_dequeue,
    bench_cancel_from_middle,
    bench_store_listing
);
criterion_main!(benches);
