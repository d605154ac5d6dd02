#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # windowtally
//!
//! Time-bucketed counter storage for rate limiting: given a resource, a limit
//! name, an optional per-request property and a cost, atomically add the cost
//! to the right window's counter and hand back the new total. Deciding whether
//! that total breaches a limit is left to the caller.
//!
//! ## Features
//!
//! - **Deterministic buckets**: event timestamps are truncated to
//!   expiration-aligned windows, so arrival order never matters
//! - **Atomic add-and-get** with an optional ceiling that stops counting once
//!   a limit is breached
//! - **Weighted sliding windows** that blend a fraction of the previous window
//!   into the current total
//! - **Batches** with per-entry failure isolation and a configurable
//!   fail-open / fail-closed policy
//! - **Backends**: [`LocalCounterStore`] here, Redis in `windowtally-redis`
//!
//! ## Quick Start
//!
//! ```rust
//! use windowtally::{AddAndGetRequest, CounterStore, LocalCounterStore, RequestBatch};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), windowtally::StoreError> {
//!     let store = LocalCounterStore::new();
//!     let request = AddAndGetRequest::builder()
//!         .resource("api")
//!         .limit_name("requests_per_minute")
//!         .property("user-42")
//!         .expiration(Duration::from_secs(60))
//!         .build()?;
//!     let key = request.key().clone();
//!
//!     let outcome = store.add_and_get(&RequestBatch::from(vec![request])).await;
//!     assert_eq!(outcome.get(&key), Some(1));
//!     assert!(!outcome.exceeds(&key, 100));
//!     store.close().await
//! }
//! ```

pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod filter;
pub mod key;
pub mod local;
pub mod request;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailureMode, SharedConfig, StoreConfig};
pub use counter::Counter;
pub use error::{BoxError, StoreError};
pub use filter::CounterFilter;
pub use key::{BucketKey, KEY_SEPARATOR};
pub use local::LocalCounterStore;
pub use request::{AddAndGetRequest, AddAndGetRequestBuilder, RequestBatch};
pub use store::{BatchOutcome, CounterStore, Counts};
