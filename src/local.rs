//! In-process counter store.
//!
//! Buckets live in a sharded concurrent map. An increment holds its shard's
//! guard for the duration of the atomic add, and eviction takes the shard's
//! write lock, so a sweep can never drop a bucket between lookup and add.
//!
//! Each bucket remembers how many windows it must outlive its own. Buckets
//! written on the weighted path (and overridden buckets) are kept for two, so a
//! later weighted request can still read them as its previous window; every
//! sweep honours that, and snapshots hide finished windows without deleting them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{FailureMode, SharedConfig, StoreConfig};
use crate::counter::Counter;
use crate::error::StoreError;
use crate::filter::CounterFilter;
use crate::key::{self, BucketKey};
use crate::request::RequestBatch;
use crate::store::{BatchOutcome, CounterStore, Counts};

/// A bucket's counter plus the number of windows it is retained for.
#[derive(Debug)]
struct Slot {
    counter: Counter,
    windows: AtomicU32,
}

impl Default for Slot {
    fn default() -> Self {
        Self::new(0, PLAIN_WINDOWS)
    }
}

impl Slot {
    fn new(value: u64, windows: u32) -> Self {
        Self { counter: Counter::new(value), windows: AtomicU32::new(windows) }
    }

    /// Lifetimes only grow; a plain increment never shortens a weighted bucket.
    fn retain_for(&self, windows: u32) -> &Counter {
        self.windows.fetch_max(windows, Ordering::AcqRel);
        &self.counter
    }

    fn windows(&self) -> u32 {
        self.windows.load(Ordering::Acquire)
    }
}

const PLAIN_WINDOWS: u32 = 1;
const WEIGHTED_WINDOWS: u32 = 2;

/// Single-process store; perfect for local limits, not shared across processes.
#[derive(Debug)]
pub struct LocalCounterStore {
    counters: DashMap<BucketKey, Slot>,
    clock: Arc<dyn Clock>,
    failure_mode: SharedConfig<FailureMode>,
    sweep_on_write: bool,
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            counters: DashMap::new(),
            clock: Arc::new(SystemClock),
            failure_mode: SharedConfig::new(config.failure_mode),
            sweep_on_write: config.sweep_on_write,
        }
    }

    /// Replace the wall clock used for eviction.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Live handle to the failure mode; updates apply to the next batch.
    pub fn failure_mode_handle(&self) -> SharedConfig<FailureMode> {
        self.failure_mode.clone()
    }

    /// Number of buckets currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Visit every held bucket. Do not call back into the store from `f`.
    pub fn for_each_counter(&self, mut f: impl FnMut(&BucketKey, &Counter)) {
        for entry in self.counters.iter() {
            f(entry.key(), &entry.value().counter);
        }
    }

    fn add(&self, key: &BucketKey, cost: u64, windows: u32) -> u64 {
        if let Some(slot) = self.counters.get(key) {
            return slot.retain_for(windows).add_and_get(cost);
        }
        self.counters.entry(key.clone()).or_default().retain_for(windows).add_and_get(cost)
    }

    fn add_with_ceiling(&self, key: &BucketKey, cost: u64, ceiling: u64, carried: u64) -> u64 {
        if let Some(slot) = self.counters.get(key) {
            return slot.retain_for(WEIGHTED_WINDOWS).add_and_get_with_ceiling(cost, ceiling, carried);
        }
        self.counters
            .entry(key.clone())
            .or_default()
            .retain_for(WEIGHTED_WINDOWS)
            .add_and_get_with_ceiling(cost, ceiling, carried)
    }

    fn peek(&self, key: &BucketKey) -> u64 {
        self.counters.get(key).map(|slot| slot.value().counter.get()).unwrap_or(0)
    }

    /// Drop buckets whose lifetime, at least `min_windows` long, ended strictly
    /// before `now_millis`.
    fn evict(&self, now_millis: u64, min_windows: u32) {
        let before = self.counters.len();
        self.counters.retain(|k, slot| !k.is_expired_at(now_millis, slot.windows().max(min_windows)));
        let evicted = before.saturating_sub(self.counters.len());
        if evicted > 0 {
            debug!(target: "windowtally::local", evicted, min_windows, now_millis, "evicted expired buckets");
        }
    }

    fn evict_by_wall_clock(&self) {
        self.evict(self.clock.now_millis(), PLAIN_WINDOWS);
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn add_and_get(&self, batch: &RequestBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(*self.failure_mode.get());
        for request in batch {
            let total = self.add(request.key(), request.cost(), PLAIN_WINDOWS);
            outcome.record(request.key().clone(), total);
        }
        if self.sweep_on_write {
            self.evict_by_wall_clock();
        }
        debug!(target: "windowtally::local", entries = batch.len(), "add_and_get batch");
        outcome
    }

    async fn add_and_get_with_limit(&self, batch: &RequestBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(*self.failure_mode.get());
        for request in batch {
            let key = request.key();
            let previous = key.previous().map(|prev| self.peek(&prev)).unwrap_or(0);
            let carried = request.carried_over(previous);
            let current = match request.limit() {
                Some(limit) => self.add_with_ceiling(key, request.cost(), limit, carried),
                None => self.add(key, request.cost(), WEIGHTED_WINDOWS),
            };
            outcome.record(key.clone(), current.saturating_add(carried));
        }
        // Traffic-driven: the previous window must stay readable for one extra window.
        if let (true, Some(latest)) = (self.sweep_on_write, batch.latest_timestamp()) {
            self.evict(key::millis_since_epoch(latest), WEIGHTED_WINDOWS);
        }
        debug!(target: "windowtally::local", entries = batch.len(), "add_and_get_with_limit batch");
        outcome
    }

    async fn current_counters(&self, filter: &CounterFilter) -> Result<Counts, StoreError> {
        let now = self.clock.now_millis();
        self.evict(now, PLAIN_WINDOWS);
        // Buckets kept for a weighted lookup stay stored but are not reported.
        Ok(self
            .counters
            .iter()
            .filter(|entry| filter.matches(entry.key()) && !entry.key().is_expired_at(now, PLAIN_WINDOWS))
            .map(|entry| (entry.key().clone(), entry.value().counter.get()))
            .collect())
    }

    async fn override_keys(&self, overrides: &[(BucketKey, u64)]) -> Result<(), StoreError> {
        // An overridden bucket may be seeding a later weighted lookup.
        for (key, value) in overrides {
            self.counters.entry(key.clone()).or_default().retain_for(WEIGHTED_WINDOWS).set(*value);
        }
        self.evict_by_wall_clock();
        Ok(())
    }

    fn failure_mode(&self) -> FailureMode {
        *self.failure_mode.get()
    }

    async fn close(self) -> Result<(), StoreError> {
        info!(target: "windowtally::local", buckets = self.counters.len(), "local counter store closed");
        Ok(())
    }
}
