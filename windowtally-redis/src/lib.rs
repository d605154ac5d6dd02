//! Redis counter store for `windowtally` (companion crate).
//!
//! Every bucket is a Redis string under `namespace|resource|limit|property|start|expiration`.
//! Increments run server-side through one Lua script that reads, caps, writes and
//! refreshes the key's TTL atomically, so concurrent processes never lose updates
//! and buckets expire on their own without a client-side sweep.
//!
//! ```rust,no_run
//! use windowtally::{CounterStore, CounterFilter};
//! use windowtally_redis::{RedisCounterStore, RedisStoreConfig};
//! use std::time::{Duration, SystemTime};
//!
//! # async fn demo() -> Result<(), windowtally::StoreError> {
//! let store = RedisCounterStore::connect(RedisStoreConfig::new("redis://127.0.0.1:6379")).await?;
//! let (key, total) = store
//!     .increment_and_get("api", "rps", "user-1", true, Duration::from_secs(1), SystemTime::now())
//!     .await?;
//! let live = store.current_counters(&CounterFilter::resource("api")).await?;
//! assert_eq!(live.get(&key), Some(&total));
//! store.close().await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};
use windowtally::{
    AddAndGetRequest, BatchOutcome, BucketKey, Clock, CounterFilter, CounterStore, Counts,
    FailureMode, RequestBatch, SharedConfig, StoreError, SystemClock, KEY_SEPARATOR,
};

mod config;
mod script;

pub use config::RedisStoreConfig;
use script::CounterScript;

/// Distributed counter store backed by Redis.
///
/// Cloning the multiplexed connection per call means no local lock is held while
/// waiting on the network; unrelated buckets never queue behind a slow call.
///
/// The store itself is not `Clone`: share it through an `Arc`, so that
/// [`close`](CounterStore::close) consumes the only handle.
///
/// ```compile_fail
/// fn shareable<T: Clone>() {}
/// shareable::<windowtally_redis::RedisCounterStore>();
/// ```
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
    script: CounterScript,
    namespace: String,
    scan_count: usize,
    failure_mode: SharedConfig<FailureMode>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("namespace", &self.namespace)
            .field("scan_count", &self.scan_count)
            .field("failure_mode", &*self.failure_mode.get())
            .field("connection", &"<redis::aio::MultiplexedConnection>")
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to `config.url` and load the counter script.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad config or URL, `BackendUnavailable` if the
    /// server cannot be reached, `ResourceLoad` if the script cannot be loaded.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::InvalidArgument(format!("redis url '{}': {e}", config.url)))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::backend(config.url.clone(), e))?;
        Self::from_connection(connection, config).await
    }

    /// Build a store on an existing connection; `config.url` is ignored.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad config, `ResourceLoad` if the script cannot be loaded.
    pub async fn from_connection(
        mut connection: MultiplexedConnection,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let script = CounterScript::load(&mut connection).await?;
        info!(target: "windowtally::redis", namespace = %config.namespace, "redis counter store ready");
        Ok(Self {
            connection,
            script,
            namespace: config.namespace,
            scan_count: config.scan_count,
            failure_mode: SharedConfig::new(config.store.failure_mode),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the wall clock used to hide finished windows from snapshots.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Live handle to the failure mode; updates apply to the next batch.
    pub fn failure_mode_handle(&self) -> SharedConfig<FailureMode> {
        self.failure_mode.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn increment(
        &self,
        request: &AddAndGetRequest,
        ceiling: Option<u64>,
        counted: u64,
        windows: u32,
    ) -> Result<u64, StoreError> {
        let name = request.key().encode(&self.namespace);
        let mut conn = self.connection.clone();
        let ttl = ttl_secs(request.expiration(), windows);
        let total = self
            .script
            .add_and_get(&mut conn, &name, request.cost(), ceiling, counted, ttl)
            .await
            .map_err(|e| StoreError::backend(name.clone(), e))?;
        to_count(&name, total)
    }

    async fn previous_count(&self, key: &BucketKey) -> Result<u64, StoreError> {
        let Some(previous) = key.previous() else {
            return Ok(0);
        };
        let name = previous.encode(&self.namespace);
        let mut conn = self.connection.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(&name)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend(name.clone(), e))?;
        value.map_or(Ok(0), |v| to_count(&name, v))
    }

    async fn limited_increment(&self, request: &AddAndGetRequest) -> Result<u64, StoreError> {
        let carried = request.carried_over(self.previous_count(request.key()).await?);
        let current = self.increment(request, request.limit(), carried, 2).await?;
        Ok(current.saturating_add(carried))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut names = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::backend(pattern, e))?;
            names.extend(batch);
            if next == 0 {
                return Ok(names);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn add_and_get(&self, batch: &RequestBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(*self.failure_mode.get());
        for request in batch {
            match self.increment(request, None, 0, 1).await {
                Ok(total) => outcome.record(request.key().clone(), total),
                Err(e) => {
                    warn!(target: "windowtally::redis", bucket = %request.key(), error = %e, "add_and_get entry failed");
                    outcome.record_failure(request.key().clone(), e);
                }
            }
        }
        debug!(target: "windowtally::redis", entries = batch.len(), failed = outcome.failures().len(), "add_and_get batch");
        outcome
    }

    async fn add_and_get_with_limit(&self, batch: &RequestBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::new(*self.failure_mode.get());
        for request in batch {
            match self.limited_increment(request).await {
                Ok(total) => outcome.record(request.key().clone(), total),
                Err(e) => {
                    warn!(target: "windowtally::redis", bucket = %request.key(), error = %e, "add_and_get_with_limit entry failed");
                    outcome.record_failure(request.key().clone(), e);
                }
            }
        }
        debug!(target: "windowtally::redis", entries = batch.len(), failed = outcome.failures().len(), "add_and_get_with_limit batch");
        outcome
    }

    async fn current_counters(&self, filter: &CounterFilter) -> Result<Counts, StoreError> {
        let pattern = match_pattern(&self.namespace, filter);
        let now = self.clock.now_millis();
        let names = self.scan(&pattern).await?;
        let mut counts = Counts::new();
        let mut conn = self.connection.clone();
        for chunk in names.chunks(self.scan_count) {
            let mut mget = redis::cmd("MGET");
            for name in chunk {
                mget.arg(name);
            }
            let values: Vec<Option<i64>> = mget
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::backend(pattern.clone(), e))?;
            for (name, value) in chunk.iter().zip(values) {
                // Expired between SCAN and MGET.
                let Some(value) = value else { continue };
                match BucketKey::decode(&self.namespace, name) {
                    // TTLs outlive the window; report only buckets still in it.
                    Ok(key) if filter.matches(&key) && !key.is_expired_at(now, 1) => {
                        counts.insert(key, to_count(name, value)?);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "windowtally::redis", key = %name, error = %e, "skipping undecodable key");
                    }
                }
            }
        }
        Ok(counts)
    }

    async fn override_keys(&self, overrides: &[(BucketKey, u64)]) -> Result<(), StoreError> {
        if overrides.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in overrides {
            let value = override_value(key, *value)?;
            pipe.cmd("SET")
                .arg(key.encode(&self.namespace))
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(key.expiration(), 1))
                .ignore();
        }
        let mut conn = self.connection.clone();
        let () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend(overrides[0].0.encode(&self.namespace), e))?;
        Ok(())
    }

    fn failure_mode(&self) -> FailureMode {
        *self.failure_mode.get()
    }

    async fn close(self) -> Result<(), StoreError> {
        // Dropping the last handle shuts the multiplexed connection down.
        drop(self.connection);
        info!(target: "windowtally::redis", namespace = %self.namespace, "redis counter store closed");
        Ok(())
    }
}

/// TTL covering `windows` expirations, rounded up to whole seconds, at least one.
fn ttl_secs(expiration: Duration, windows: u32) -> u64 {
    let span = expiration.saturating_mul(windows);
    let secs = span.as_secs() + u64::from(span.subsec_nanos() > 0);
    secs.max(1)
}

/// Redis integers are signed 64-bit; anything larger would break later `INCRBY`s.
fn override_value(key: &BucketKey, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidArgument(format!("override {value} for {key} exceeds {}", i64::MAX)))
}

fn to_count(name: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::backend(name, format!("negative counter value {value}")))
}

/// `SCAN MATCH` pattern for the keys `filter` can select.
fn match_pattern(namespace: &str, filter: &CounterFilter) -> String {
    let mut pattern = escape_glob(namespace);
    let parts = [filter.resource_name(), filter.limit_name(), filter.property_name()];
    for part in parts.into_iter().map_while(|p| p) {
        pattern.push(KEY_SEPARATOR);
        pattern.push_str(&escape_glob(part));
    }
    pattern.push(KEY_SEPARATOR);
    pattern.push('*');
    pattern
}

fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_and_scales_with_windows() {
        assert_eq!(ttl_secs(Duration::from_secs(60), 1), 60);
        assert_eq!(ttl_secs(Duration::from_secs(60), 2), 120);
        assert_eq!(ttl_secs(Duration::from_millis(1_500), 1), 2);
        assert_eq!(ttl_secs(Duration::from_millis(10), 1), 1);
    }

    #[test]
    fn pattern_narrows_with_each_filter_field() {
        assert_eq!(match_pattern("wt", &CounterFilter::all()), "wt|*");
        assert_eq!(match_pattern("wt", &CounterFilter::resource("api")), "wt|api|*");
        assert_eq!(match_pattern("wt", &CounterFilter::limit("api", "rps")), "wt|api|rps|*");
        assert_eq!(match_pattern("wt", &CounterFilter::property("api", "rps", "")), "wt|api|rps||*");
    }

    #[test]
    fn pattern_escapes_glob_metacharacters() {
        assert_eq!(match_pattern("wt", &CounterFilter::resource("a*[b]?")), r"wt|a\*\[b\]\?|*");
    }

    #[test]
    fn overrides_must_fit_a_redis_integer() {
        let key = BucketKey::derive("api", "rps", "", std::time::UNIX_EPOCH, Duration::from_secs(60)).unwrap();
        assert_eq!(override_value(&key, 42).unwrap(), 42);
        assert_eq!(override_value(&key, i64::MAX as u64).unwrap(), i64::MAX);
        assert!(override_value(&key, i64::MAX as u64 + 1).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn negative_values_are_backend_errors() {
        assert_eq!(to_count("k", 5).unwrap(), 5);
        assert!(to_count("k", -1).unwrap_err().is_backend_unavailable());
    }
}
