//! Bucket identity: deterministic window alignment and the encoded key format.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// Separator between fields of an encoded bucket key.
pub const KEY_SEPARATOR: char = '|';

/// Identifies one counter bucket of a `(resource, limit, property)` series.
///
/// Two events of the same series whose timestamps fall in the same
/// expiration-aligned window produce equal keys, whatever order they arrive in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketKey {
    resource: String,
    limit_name: String,
    property: String,
    bucket_start: SystemTime,
    expiration: Duration,
}

impl BucketKey {
    /// Derive the key of the bucket containing `timestamp`.
    ///
    /// `bucket_start` is `timestamp` truncated down to a multiple of `expiration`
    /// counted from the Unix epoch, at millisecond resolution.
    ///
    /// # Errors
    /// `InvalidArgument` if `expiration` is under one millisecond, `timestamp` is
    /// before the epoch, or a name contains [`KEY_SEPARATOR`].
    pub fn derive(
        resource: impl Into<String>,
        limit_name: impl Into<String>,
        property: impl Into<String>,
        timestamp: SystemTime,
        expiration: Duration,
    ) -> Result<Self, StoreError> {
        let window = window_millis(expiration)?;
        let at = timestamp
            .duration_since(UNIX_EPOCH)
            .map_err(|_| StoreError::invalid("event timestamp is before the Unix epoch"))?;
        let at = u64::try_from(at.as_millis())
            .map_err(|_| StoreError::invalid("event timestamp out of range"))?;
        let start = at - at % window;

        let key = Self {
            resource: resource.into(),
            limit_name: limit_name.into(),
            property: property.into(),
            bucket_start: UNIX_EPOCH + Duration::from_millis(start),
            expiration: Duration::from_millis(window),
        };
        key.validate()?;
        Ok(key)
    }

    /// Key of the window immediately before this one, computed without storage.
    ///
    /// The first window after the epoch has no predecessor and returns `None`.
    pub fn previous(&self) -> Option<Self> {
        let start = self.bucket_start.checked_sub(self.expiration)?;
        start.duration_since(UNIX_EPOCH).ok()?;
        Some(Self { bucket_start: start, ..self.clone() })
    }

    /// Key of the window immediately after this one.
    pub fn next(&self) -> Self {
        Self { bucket_start: self.bucket_start + self.expiration, ..self.clone() }
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

    pub fn bucket_start(&self) -> SystemTime {
        self.bucket_start
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Bucket start in milliseconds since the epoch.
    pub fn bucket_start_millis(&self) -> u64 {
        millis_since_epoch(self.bucket_start)
    }

    /// True once `now_millis` is strictly past `bucket_start + windows * expiration`.
    pub fn is_expired_at(&self, now_millis: u64, windows: u32) -> bool {
        let span = millis(self.expiration).saturating_mul(u64::from(windows));
        self.bucket_start_millis().saturating_add(span) < now_millis
    }

    /// Encode as `namespace|resource|limit|property|startMillis|expirationMillis`.
    pub fn encode(&self, namespace: &str) -> String {
        format!(
            "{ns}{s}{r}{s}{l}{s}{p}{s}{start}{s}{exp}",
            ns = namespace,
            s = KEY_SEPARATOR,
            r = self.resource,
            l = self.limit_name,
            p = self.property,
            start = self.bucket_start_millis(),
            exp = millis(self.expiration),
        )
    }

    /// Inverse of [`encode`](Self::encode).
    ///
    /// # Errors
    /// `InvalidArgument` if the name is not a well-formed key of `namespace`.
    pub fn decode(namespace: &str, encoded: &str) -> Result<Self, StoreError> {
        let rest = encoded
            .strip_prefix(namespace)
            .and_then(|r| r.strip_prefix(KEY_SEPARATOR))
            .ok_or_else(|| StoreError::invalid(format!("key '{encoded}' is outside namespace '{namespace}'")))?;
        let fields: Vec<&str> = rest.split(KEY_SEPARATOR).collect();
        let [resource, limit_name, property, start, exp] = fields.as_slice() else {
            return Err(StoreError::invalid(format!("key '{encoded}' does not have five fields")));
        };
        let start: u64 = start
            .parse()
            .map_err(|_| StoreError::invalid(format!("bad bucket start in '{encoded}'")))?;
        let exp: u64 = exp
            .parse()
            .map_err(|_| StoreError::invalid(format!("bad expiration in '{encoded}'")))?;
        if exp == 0 || start % exp != 0 {
            return Err(StoreError::invalid(format!("misaligned bucket in '{encoded}'")));
        }
        Ok(Self {
            resource: (*resource).to_string(),
            limit_name: (*limit_name).to_string(),
            property: (*property).to_string(),
            bucket_start: UNIX_EPOCH + Duration::from_millis(start),
            expiration: Duration::from_millis(exp),
        })
    }

    fn validate(&self) -> Result<(), StoreError> {
        for (field, value) in
            [("resource", &self.resource), ("limit name", &self.limit_name), ("property", &self.property)]
        {
            if value.contains(KEY_SEPARATOR) {
                return Err(StoreError::invalid(format!(
                    "{field} '{value}' contains the key separator '{KEY_SEPARATOR}'"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}+{}ms",
            self.resource,
            self.limit_name,
            self.property,
            self.bucket_start_millis(),
            millis(self.expiration)
        )
    }
}

/// Validate an expiration window and return its length in milliseconds.
pub(crate) fn window_millis(expiration: Duration) -> Result<u64, StoreError> {
    match millis(expiration) {
        0 => Err(StoreError::invalid(format!(
            "expiration must be at least one millisecond, got {expiration:?}"
        ))),
        ms => Ok(ms),
    }
}

pub(crate) fn millis_since_epoch(at: SystemTime) -> u64 {
    millis(at.duration_since(UNIX_EPOCH).unwrap_or_default())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
