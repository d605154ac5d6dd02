//! Connection and keyspace settings for the Redis store.

use windowtally::{StoreConfig, StoreError, KEY_SEPARATOR};

/// Settings for [`RedisCounterStore`](crate::RedisCounterStore).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Prefix of every bucket key; isolates tenants sharing one server.
    pub namespace: String,
    /// `COUNT` hint for each `SCAN` step of a snapshot.
    pub scan_count: usize,
    /// Backend-independent settings. `sweep_on_write` is ignored: keys expire by TTL.
    pub store: StoreConfig,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            namespace: "windowtally".into(),
            scan_count: 500,
            store: StoreConfig::default(),
        }
    }
}

impl RedisStoreConfig {
    pub const URL_ENV: &'static str = "WINDOWTALLY_REDIS_URL";
    pub const NAMESPACE_ENV: &'static str = "WINDOWTALLY_REDIS_NAMESPACE";

    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn scan_count(mut self, count: usize) -> Self {
        self.scan_count = count;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Defaults overridden by `WINDOWTALLY_REDIS_URL`, `WINDOWTALLY_REDIS_NAMESPACE`
    /// and the variables read by [`StoreConfig::from_env`].
    ///
    /// # Errors
    /// `InvalidArgument` if a variable holds an unrecognized value.
    pub fn from_env() -> Result<Self, StoreError> {
        let mut config = Self { store: StoreConfig::from_env()?, ..Self::default() };
        if let Ok(url) = std::env::var(Self::URL_ENV) {
            config.url = url;
        }
        if let Ok(namespace) = std::env::var(Self::NAMESPACE_ENV) {
            config.namespace = namespace;
        }
        Ok(config)
    }

    /// # Errors
    /// `InvalidArgument` if the namespace is empty, contains control characters
    /// or the key separator, or `scan_count` is zero.
    pub fn validate(&self) -> Result<(), StoreError> {
        let ns = &self.namespace;
        if ns.trim().is_empty() {
            return Err(StoreError::InvalidArgument("namespace cannot be empty".into()));
        }
        if ns.chars().any(|c| c.is_control() || c == KEY_SEPARATOR) {
            return Err(StoreError::InvalidArgument(format!(
                "namespace '{}' cannot contain control characters or '{KEY_SEPARATOR}'",
                ns.escape_debug()
            )));
        }
        if self.scan_count == 0 {
            return Err(StoreError::InvalidArgument("scan_count must be positive".into()));
        }
        Ok(())
    }
}
