use criterion::{black_box, criterion_group, criterion_main, Criterion};
use windowtally::{AddAndGetRequest, CounterStore, LocalCounterStore, RequestBatch};

use std::time::Duration;

// A batch of `size` requests spread over `series` properties.
fn batch(size: usize, series: usize, limit: Option<u64>) -> RequestBatch {
    (0..size)
        .map(|i| {
            let builder = AddAndGetRequest::builder()
                .resource("api")
                .limit_name("rps")
                .property(format!("user-{}", i % series))
                .expiration(Duration::from_secs(60))
                .previous_bucket_weight(0.5);
            let builder = match limit {
                Some(l) => builder.limit(l),
                None => builder,
            };
            builder.build().unwrap()
        })
        .collect()
}

fn local_add_and_get_hot_bucket(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = LocalCounterStore::new();
    let batch = batch(1, 1, None);

    c.bench_function("local_add_and_get_single_hot_bucket", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(store.add_and_get(black_box(&batch)).await);
        });
    });
}

fn local_add_and_get_with_limit_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = LocalCounterStore::new();
    // Many series so the eviction sweep has real work.
    let batch = batch(64, 1_000, Some(100));

    c.bench_function("local_add_and_get_with_limit_batch_64", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(store.add_and_get_with_limit(black_box(&batch)).await);
        });
    });
}

criterion_group!(benches, local_add_and_get_hot_bucket, local_add_and_get_with_limit_batch);
criterion_main!(benches);
