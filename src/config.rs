//! Store configuration and live-updatable handles.
//!
//! `SharedConfig` uses `ArcSwap` for lock-free reads, so the failure mode can be
//! flipped while stores are serving traffic.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::StoreError;

/// How a caller should treat an entry whose backend call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FailureMode {
    /// Missing counts are treated as "limit not exceeded".
    #[default]
    Open,
    /// Missing counts are treated as "limit exceeded".
    Closed,
}

impl std::str::FromStr for FailureMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(StoreError::invalid(format!("unknown failure mode '{other}'"))),
        }
    }
}

/// Settings shared by every store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StoreConfig {
    /// Policy handed to callers for failed entries.
    pub failure_mode: FailureMode,
    /// Sweep expired buckets after every write. Local backend only; remote
    /// buckets expire through their TTL.
    pub sweep_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { failure_mode: FailureMode::Open, sweep_on_write: true }
    }
}

impl StoreConfig {
    pub const FAILURE_MODE_ENV: &'static str = "WINDOWTALLY_FAILURE_MODE";
    pub const SWEEP_ON_WRITE_ENV: &'static str = "WINDOWTALLY_SWEEP_ON_WRITE";

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn sweep_on_write(mut self, enabled: bool) -> Self {
        self.sweep_on_write = enabled;
        self
    }

    /// Defaults overridden by `WINDOWTALLY_FAILURE_MODE` and `WINDOWTALLY_SWEEP_ON_WRITE`.
    ///
    /// # Errors
    /// `InvalidArgument` if a variable is set to an unrecognized value.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let mut config = Self::default();
        if let Some(mode) = lookup(Self::FAILURE_MODE_ENV) {
            config.failure_mode = mode.parse()?;
        }
        if let Some(sweep) = lookup(Self::SWEEP_ON_WRITE_ENV) {
            config.sweep_on_write = match sweep.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(StoreError::invalid(format!(
                        "{} must be a boolean, got '{other}'",
                        Self::SWEEP_ON_WRITE_ENV
                    )))
                }
            };
        }
        Ok(config)
    }
}

/// `SharedConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct SharedConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for SharedConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> SharedConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}
