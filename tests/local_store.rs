use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use windowtally::{
    AddAndGetRequest, BucketKey, CounterFilter, CounterStore, LocalCounterStore, ManualClock,
    RequestBatch,
};

const MINUTE: Duration = Duration::from_secs(60);
// Aligned to a minute boundary.
const T0: u64 = 1_700_000_040;

fn at(offset: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(T0 + offset)
}

fn store_at(offset: u64) -> (LocalCounterStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(at(offset)));
    (LocalCounterStore::new().with_clock(clock.clone()), clock)
}

fn limited(offset: u64, cost: u64, limit: u64, weight: f64) -> AddAndGetRequest {
    AddAndGetRequest::builder()
        .resource("api")
        .limit_name("rps")
        .expiration(MINUTE)
        .event_timestamp(at(offset))
        .cost(cost)
        .limit(limit)
        .previous_bucket_weight(weight)
        .build()
        .expect("valid request")
}

#[tokio::test]
async fn increments_share_a_bucket_until_the_window_rolls() {
    let (store, clock) = store_at(0);

    for (offset, expected) in [(0, 1), (1, 2), (2, 3)] {
        clock.set(at(offset));
        let (_, total) =
            store.increment_and_get("api", "rps", "", false, MINUTE, at(offset)).await.unwrap();
        assert_eq!(total, expected);
    }

    clock.set(at(61));
    let (new_key, total) = store.increment_and_get("api", "rps", "", false, MINUTE, at(61)).await.unwrap();
    assert_eq!(total, 1);

    let counters = store.current_counters(&CounterFilter::resource("api")).await.unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters.get(&new_key), Some(&1));
}

#[tokio::test]
async fn bucket_within_its_window_stays_visible() {
    let (store, clock) = store_at(0);
    let (key, _) = store.increment_and_get("api", "rps", "", false, MINUTE, at(5)).await.unwrap();
    store.increment_and_get("api", "rps", "", false, MINUTE, at(6)).await.unwrap();

    clock.set(at(60));
    let counters = store.current_counters(&CounterFilter::all()).await.unwrap();
    assert_eq!(counters.get(&key), Some(&2));
}

#[tokio::test]
async fn ceiling_stops_counting_at_the_limit() {
    let (store, _) = store_at(0);
    let mut totals = Vec::new();
    for _ in 0..3 {
        let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(limited(1, 3, 5, 0.0))).await;
        totals.push(outcome.get(limited(1, 3, 5, 0.0).key()).unwrap());
    }
    assert_eq!(totals, vec![3, 5, 5]);
}

#[tokio::test]
async fn weighted_window_blends_previous_bucket() {
    let (store, _) = store_at(0);
    // previous bucket P = 7
    let previous = limited(10, 7, 1_000, 0.0);
    store.add_and_get_with_limit(&RequestBatch::new().with(previous.clone())).await;

    // ceil(7 * 0.3) = 3 carried, ceiling leaves room for 7 more
    let current = limited(70, 4, 10, 0.3);
    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 4));

    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 7));

    let counters = store.current_counters(&CounterFilter::limit("api", "rps")).await.unwrap();
    assert_eq!(counters.get(previous.key()), Some(&7));
    assert_eq!(counters.get(current.key()), Some(&7));
}

#[tokio::test]
async fn snapshot_between_weighted_calls_keeps_previous_bucket() {
    let (store, clock) = store_at(10);
    let previous = limited(10, 7, 10, 0.0);
    store.add_and_get_with_limit(&RequestBatch::new().with(previous.clone())).await;

    clock.set(at(70));
    let counters = store.current_counters(&CounterFilter::all()).await.unwrap();
    // finished window is hidden, but still readable by the weighted lookup
    assert!(!counters.contains_key(previous.key()));

    let current = limited(70, 4, 10, 0.3);
    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 4));
}

#[tokio::test]
async fn plain_increment_between_weighted_calls_keeps_previous_bucket() {
    let (store, clock) = store_at(10);
    store.add_and_get_with_limit(&RequestBatch::new().with(limited(10, 7, 10, 0.0))).await;

    clock.set(at(70));
    store.increment_and_get("other", "x", "", false, MINUTE, at(70)).await.unwrap();

    let current = limited(70, 4, 10, 0.3);
    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 4));
}

#[tokio::test]
async fn overridden_previous_bucket_feeds_weighted_window() {
    let (store, _) = store_at(70);
    let current = limited(70, 4, 10, 0.3);
    let previous = current.key().previous().unwrap();
    store.override_key(&previous, 7).await.unwrap();

    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 4));
}

#[tokio::test]
async fn weighted_buckets_leave_after_their_second_window() {
    let (store, clock) = store_at(10);
    store.add_and_get_with_limit(&RequestBatch::new().with(limited(10, 7, 10, 0.0))).await;
    clock.set(at(121));
    assert!(store.current_counters(&CounterFilter::all()).await.unwrap().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn weighted_window_without_ceiling_adds_full_cost() {
    let (store, _) = store_at(0);
    let previous = limited(10, 5, 1_000, 0.0);
    store.add_and_get_with_limit(&RequestBatch::new().with(previous)).await;

    let current = AddAndGetRequest::builder()
        .resource("api")
        .limit_name("rps")
        .expiration(MINUTE)
        .event_timestamp(at(61))
        .cost(20)
        .previous_bucket_weight(0.5)
        .build()
        .unwrap();
    let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(current.clone())).await;
    assert_eq!(outcome.get(current.key()), Some(3 + 20));
}

#[tokio::test]
async fn override_replaces_accumulated_value() {
    let (store, _) = store_at(0);
    let (key, _) = store.increment_and_get("api", "rps", "u1", false, MINUTE, at(1)).await.unwrap();
    store.increment_and_get("api", "rps", "u1", false, MINUTE, at(2)).await.unwrap();

    store.override_key(&key, 42).await.unwrap();
    let counters = store.current_counters(&CounterFilter::property("api", "rps", "u1")).await.unwrap();
    assert_eq!(counters.get(&key), Some(&42));
}

#[tokio::test]
async fn override_of_expired_bucket_is_evicted() {
    let (store, _) = store_at(600);
    let stale = BucketKey::derive("api", "rps", "", at(0), MINUTE).unwrap();
    store.override_keys(&[(stale, 9)]).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn filters_select_by_resource_limit_and_property() {
    let (store, _) = store_at(0);
    let batch: RequestBatch = [("api", "rps", "u1"), ("api", "rps", "u2"), ("api", "rpm", "u1"), ("web", "rps", "u1")]
        .into_iter()
        .map(|(r, l, p)| {
            AddAndGetRequest::builder()
                .resource(r)
                .limit_name(l)
                .property(p)
                .expiration(MINUTE)
                .event_timestamp(at(1))
                .build()
                .unwrap()
        })
        .collect();
    let outcome = store.add_and_get(&batch).await;
    assert_eq!(outcome.counts().len(), 4);

    assert_eq!(count(&store, CounterFilter::all()).await, 4);
    assert_eq!(count(&store, CounterFilter::resource("api")).await, 3);
    assert_eq!(count(&store, CounterFilter::limit("api", "rps")).await, 2);
    assert_eq!(count(&store, CounterFilter::property("api", "rps", "u2")).await, 1);
    assert_eq!(count(&store, CounterFilter::resource("nope")).await, 0);
}

async fn count(store: &LocalCounterStore, filter: CounterFilter) -> usize {
    store.current_counters(&filter).await.unwrap().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_not_lost() {
    let (store, _) = store_at(0);
    let store = Arc::new(store);
    let tasks = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..250 {
                store.increment_and_get("api", "rps", "", false, MINUTE, at(3)).await.unwrap();
            }
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let key = BucketKey::derive("api", "rps", "", at(3), MINUTE).unwrap();
    let counters = store.current_counters(&CounterFilter::all()).await.unwrap();
    assert_eq!(counters.get(&key), Some(&4_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_limited_increments_respect_ceiling() {
    let (store, _) = store_at(0);
    let store = Arc::new(store);
    let tasks = (0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let req = limited(4, 2, 75, 0.0);
                let outcome = store.add_and_get_with_limit(&RequestBatch::new().with(req.clone())).await;
                assert!(outcome.get(req.key()).unwrap() <= 75);
            }
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    let counters = store.current_counters(&CounterFilter::all()).await.unwrap();
    assert_eq!(counters.values().copied().collect::<Vec<_>>(), vec![75]);
}

#[tokio::test]
async fn close_consumes_the_store() {
    let (store, _) = store_at(0);
    store.increment_and_get("api", "rps", "", false, MINUTE, at(0)).await.unwrap();
    store.close().await.unwrap();
}
