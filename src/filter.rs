//! Snapshot filters.

use crate::key::BucketKey;

/// Conjunction of optional equality checks on a bucket's series.
///
/// A limit name is only meaningful with a resource, and a property only with
/// both, so the constructors only build those combinations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterFilter {
    resource: Option<String>,
    limit_name: Option<String>,
    property: Option<String>,
}

impl CounterFilter {
    /// Matches every bucket.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn resource(resource: impl Into<String>) -> Self {
        Self { resource: Some(resource.into()), ..Self::default() }
    }

    pub fn limit(resource: impl Into<String>, limit_name: impl Into<String>) -> Self {
        Self { limit_name: Some(limit_name.into()), ..Self::resource(resource) }
    }

    pub fn property(
        resource: impl Into<String>,
        limit_name: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self { property: Some(property.into()), ..Self::limit(resource, limit_name) }
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn limit_name(&self) -> Option<&str> {
        self.limit_name.as_deref()
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.as_deref()
    }

    pub fn matches(&self, key: &BucketKey) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            !matches!(want, Some(w) if w != have)
        }
        eq(&self.resource, key.resource())
            && eq(&self.limit_name, key.limit_name())
            && eq(&self.property, key.property())
    }
}
