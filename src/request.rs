//! Increment requests and the batches that carry them to a store.

use std::time::{Duration, SystemTime};

use crate::error::StoreError;
use crate::key::{self, BucketKey};

/// One increment against one bucket series.
///
/// Built through [`AddAndGetRequest::builder`], which validates every field so
/// a store never sees a malformed request.
#[derive(Debug, Clone, PartialEq)]
pub struct AddAndGetRequest {
    resource: String,
    limit_name: String,
    property: String,
    cost: u64,
    event_timestamp: SystemTime,
    expiration: Duration,
    distributed: bool,
    limit: Option<u64>,
    previous_bucket_weight: f64,
    key: BucketKey,
}

impl AddAndGetRequest {
    pub fn builder() -> AddAndGetRequestBuilder {
        AddAndGetRequestBuilder::default()
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn limit_name(&self) -> &str {
        &self.limit_name
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn event_timestamp(&self) -> SystemTime {
        self.event_timestamp
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Whether the limit is shared across processes when a caching layer sits in front of a store.
    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// Ceiling the bucket may report before increments are suppressed.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Fraction of the previous bucket blended into the effective total.
    pub fn previous_bucket_weight(&self) -> f64 {
        self.previous_bucket_weight
    }

    /// Bucket this request increments.
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Carry-over charged from `previous_count`: `ceil(previous_count * weight)`.
    pub fn carried_over(&self, previous_count: u64) -> u64 {
        if self.previous_bucket_weight <= 0.0 || previous_count == 0 {
            return 0;
        }
        // f64 -> u64 casts saturate.
        (previous_count as f64 * self.previous_bucket_weight).ceil() as u64
    }
}

/// Builder for [`AddAndGetRequest`].
#[derive(Debug, Clone)]
pub struct AddAndGetRequestBuilder {
    resource: Option<String>,
    limit_name: Option<String>,
    property: String,
    cost: u64,
    event_timestamp: Option<SystemTime>,
    expiration: Option<Duration>,
    distributed: bool,
    limit: Option<u64>,
    previous_bucket_weight: f64,
}

impl Default for AddAndGetRequestBuilder {
    fn default() -> Self {
        Self {
            resource: None,
            limit_name: None,
            property: String::new(),
            cost: 1,
            event_timestamp: None,
            expiration: None,
            distributed: false,
            limit: None,
            previous_bucket_weight: 0.0,
        }
    }
}

impl AddAndGetRequestBuilder {
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn limit_name(mut self, limit_name: impl Into<String>) -> Self {
        self.limit_name = Some(limit_name.into());
        self
    }

    /// Per-request property (user id, IP, ...). Defaults to empty.
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = property.into();
        self
    }

    /// Defaults to 1.
    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Defaults to `SystemTime::now()` at build time.
    pub fn event_timestamp(mut self, at: SystemTime) -> Self {
        self.event_timestamp = Some(at);
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn previous_bucket_weight(mut self, weight: f64) -> Self {
        self.previous_bucket_weight = weight;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// `InvalidArgument` when resource, limit name or expiration is missing, the
    /// weight is outside `[0, 1]`, or the bucket key cannot be derived.
    pub fn build(self) -> Result<AddAndGetRequest, StoreError> {
        let resource = self.resource.ok_or_else(|| StoreError::invalid("resource is required"))?;
        let limit_name =
            self.limit_name.ok_or_else(|| StoreError::invalid("limit name is required"))?;
        let expiration =
            self.expiration.ok_or_else(|| StoreError::invalid("expiration is required"))?;
        key::window_millis(expiration)?;
        if !(0.0..=1.0).contains(&self.previous_bucket_weight) {
            return Err(StoreError::invalid(format!(
                "previous bucket weight must be within [0, 1], got {}",
                self.previous_bucket_weight
            )));
        }
        let event_timestamp = self.event_timestamp.unwrap_or_else(SystemTime::now);
        let key = BucketKey::derive(
            resource.clone(),
            limit_name.clone(),
            self.property.clone(),
            event_timestamp,
            expiration,
        )?;

        Ok(AddAndGetRequest {
            resource,
            limit_name,
            property: self.property,
            cost: self.cost,
            event_timestamp,
            expiration,
            distributed: self.distributed,
            limit: self.limit,
            previous_bucket_weight: self.previous_bucket_weight,
            key,
        })
    }
}

/// Ordered requests submitted to a store in one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBatch {
    requests: Vec<AddAndGetRequest>,
}

impl RequestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: AddAndGetRequest) {
        self.requests.push(request);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, request: AddAndGetRequest) -> Self {
        self.push(request);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AddAndGetRequest> {
        self.requests.iter()
    }

    /// Latest event timestamp in the batch; drives weighted-window eviction.
    pub fn latest_timestamp(&self) -> Option<SystemTime> {
        self.requests.iter().map(|r| r.event_timestamp).max()
    }
}

impl From<Vec<AddAndGetRequest>> for RequestBatch {
    fn from(requests: Vec<AddAndGetRequest>) -> Self {
        Self { requests }
    }
}

impl FromIterator<AddAndGetRequest> for RequestBatch {
    fn from_iter<I: IntoIterator<Item = AddAndGetRequest>>(iter: I) -> Self {
        Self { requests: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a RequestBatch {
    type Item = &'a AddAndGetRequest;
    type IntoIter = std::slice::Iter<'a, AddAndGetRequest>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.iter()
    }
}
