//! The counter store contract shared by every backend.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::config::FailureMode;
use crate::error::StoreError;
use crate::filter::CounterFilter;
use crate::key::BucketKey;
use crate::request::{AddAndGetRequest, RequestBatch};

/// Bucket totals keyed by bucket.
pub type Counts = HashMap<BucketKey, u64>;

/// Abstract storage for time-bucketed rate-limit counters.
///
/// Increments to the same bucket are serialized by the backend; increments to
/// different buckets are independent. Stores are owned values: build one per
/// use site (or share it behind an `Arc`) and hand it back to [`close`](Self::close).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add each request's cost to its bucket and collect the new totals.
    ///
    /// A failure on one entry is recorded in the outcome and does not stop the
    /// rest of the batch.
    async fn add_and_get(&self, batch: &RequestBatch) -> BatchOutcome;

    /// Weighted sliding-window variant of [`add_and_get`](Self::add_and_get).
    ///
    /// For each request, `carried = ceil(previous_bucket * weight)` is charged
    /// first, the current bucket grows by at most `limit - carried`, and the
    /// reported total is `current + carried`.
    async fn add_and_get_with_limit(&self, batch: &RequestBatch) -> BatchOutcome;

    /// Snapshot of live buckets matching `filter`.
    ///
    /// Can be expensive on distributed backends; keep it off latency-critical paths.
    async fn current_counters(&self, filter: &CounterFilter) -> Result<Counts, StoreError>;

    /// Replace bucket values outright. Administrative; bypasses add semantics.
    async fn override_keys(&self, overrides: &[(BucketKey, u64)]) -> Result<(), StoreError>;

    /// Single-key form of [`override_keys`](Self::override_keys).
    async fn override_key(&self, key: &BucketKey, value: u64) -> Result<(), StoreError> {
        self.override_keys(&[(key.clone(), value)]).await
    }

    /// Run one request and return its bucket and total.
    async fn add_and_get_one(
        &self,
        request: AddAndGetRequest,
    ) -> Result<(BucketKey, u64), StoreError> {
        let key = request.key().clone();
        let mut outcome = self.add_and_get(&RequestBatch::from(vec![request])).await;
        outcome.take(&key)
    }

    /// Add a cost of one to the bucket of `event_timestamp`.
    async fn increment_and_get(
        &self,
        resource: &str,
        limit_name: &str,
        property: &str,
        distributed: bool,
        expiration: Duration,
        event_timestamp: SystemTime,
    ) -> Result<(BucketKey, u64), StoreError> {
        let request = AddAndGetRequest::builder()
            .resource(resource)
            .limit_name(limit_name)
            .property(property)
            .distributed(distributed)
            .expiration(expiration)
            .event_timestamp(event_timestamp)
            .build()?;
        self.add_and_get_one(request).await
    }

    /// Failure mode currently configured for this store.
    fn failure_mode(&self) -> FailureMode;

    /// Release backend resources. Consumes the store, so it cannot run twice.
    async fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Per-entry results of one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    counts: Counts,
    failures: Vec<(BucketKey, StoreError)>,
    failure_mode: FailureMode,
}

impl BatchOutcome {
    /// Empty outcome stamped with the failure mode live for this batch.
    pub fn new(failure_mode: FailureMode) -> Self {
        Self { counts: Counts::new(), failures: Vec::new(), failure_mode }
    }

    /// Record a total; a later entry for the same bucket replaces an earlier one.
    pub fn record(&mut self, key: BucketKey, total: u64) {
        self.counts.insert(key, total);
    }

    pub fn record_failure(&mut self, key: BucketKey, error: StoreError) {
        self.failures.push((key, error));
    }

    pub fn get(&self, key: &BucketKey) -> Option<u64> {
        self.counts.get(key).copied()
    }

    pub fn counts(&self) -> &Counts {
        &self.counts
    }

    pub fn into_counts(self) -> Counts {
        self.counts
    }

    pub fn failures(&self) -> &[(BucketKey, StoreError)] {
        &self.failures
    }

    /// True if every entry produced a total.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Whether the bucket's total is over `limit`.
    ///
    /// A bucket with no total (its backend call failed) resolves through the
    /// failure mode: `Open` reports not exceeded, `Closed` reports exceeded.
    pub fn exceeds(&self, key: &BucketKey, limit: u64) -> bool {
        match self.get(key) {
            Some(total) => total > limit,
            None => self.failure_mode == FailureMode::Closed,
        }
    }

    /// Remove and return the result for `key`.
    ///
    /// # Errors
    /// The recorded backend error if the entry failed, `InvalidArgument` if the
    /// batch had no such entry.
    pub fn take(&mut self, key: &BucketKey) -> Result<(BucketKey, u64), StoreError> {
        if let Some((key, total)) = self.counts.remove_entry(key) {
            return Ok((key, total));
        }
        match self.failures.iter().position(|(k, _)| k == key) {
            Some(idx) => Err(self.failures.remove(idx).1),
            None => Err(StoreError::invalid(format!("no result recorded for bucket {key}"))),
        }
    }
}
