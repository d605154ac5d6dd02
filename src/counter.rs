//! Atomic counter cell backing one bucket.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter supporting add-and-get with an optional ceiling.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new(value: u64) -> Self {
        Self { value: AtomicU64::new(value) }
    }

    /// Add `cost` and return the new total.
    pub fn add_and_get(&self, cost: u64) -> u64 {
        let prev = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_add(cost)))
            .unwrap_or_else(|v| v);
        prev.saturating_add(cost)
    }

    /// Add `cost` without letting the total exceed `ceiling - already_counted`.
    ///
    /// Once the counter has reached that bound it is left untouched and the
    /// current value is returned, so `returned + already_counted <= ceiling`
    /// holds whenever `already_counted <= ceiling`.
    pub fn add_and_get_with_ceiling(&self, cost: u64, ceiling: u64, already_counted: u64) -> u64 {
        let bound = ceiling.saturating_sub(already_counted);
        match self.value.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            (v < bound).then(|| v.saturating_add(cost).min(bound))
        }) {
            Ok(prev) => prev.saturating_add(cost).min(bound),
            Err(current) => current,
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Administrative override; not for the hot path.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}
