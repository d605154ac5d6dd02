//! Error types for counter stores
use std::error::Error as StdError;

/// Boxed error used as the source of backend failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Unified error type for all counter stores.
///
/// Backend errors are never retried inside a store: adding cost is not
/// idempotent, so a blind retry could count the same request twice.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A request was malformed and rejected before storage was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The backend could not execute the atomic operation for one key.
    #[error("backend unavailable for '{key}': {source}")]
    BackendUnavailable {
        /// Encoded key the operation was addressed to.
        key: String,
        #[source]
        source: BoxError,
    },
    /// A resource required for atomic operation could not be loaded.
    #[error("failed to load resource '{name}': {reason}")]
    ResourceLoad { name: String, reason: String },
    /// Releasing backend resources failed.
    #[error("failed to close store: {0}")]
    Close(#[source] BoxError),
}

impl StoreError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Wrap a backend failure addressed to `key`.
    pub fn backend(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::BackendUnavailable { key: key.into(), source: source.into() }
    }

    /// Check if the request itself was rejected.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Check if the backend failed to execute the operation.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Check if a startup resource failed to load.
    pub fn is_resource_load(&self) -> bool {
        matches!(self, Self::ResourceLoad { .. })
    }

    /// Check if closing the store failed.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}
