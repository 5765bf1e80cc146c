//! What to read: segments, keys and delivery guarantee of one operation.

use crate::types::{CacheKey, DeliveryGuarantee, SegmentSet};
use std::collections::HashSet;

/// Parameters shared by reductions and publishers, locally and across the
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherRequest<K: CacheKey> {
    /// Segments to read. `None` means every segment.
    pub segments: Option<SegmentSet>,

    /// Read only these keys instead of scanning segments.
    pub keys: Option<HashSet<K>>,

    /// Keys to skip, typically already delivered by an earlier attempt.
    pub excluded_keys: Option<HashSet<K>>,

    pub guarantee: DeliveryGuarantee,

    /// Split a local reduction across workers.
    pub parallel: bool,

    /// Consult a backing store rather than in-memory data only.
    pub include_loader: bool,
}

impl<K: CacheKey> PublisherRequest<K> {
    /// Read every segment with the given guarantee.
    pub fn new(guarantee: DeliveryGuarantee) -> Self {
        Self {
            segments: None,
            keys: None,
            excluded_keys: None,
            guarantee,
            parallel: false,
            include_loader: true,
        }
    }

    pub fn with_segments(mut self, segments: SegmentSet) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn with_keys(mut self, keys: HashSet<K>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_excluded_keys(mut self, keys: HashSet<K>) -> Self {
        self.excluded_keys = if keys.is_empty() { None } else { Some(keys) };
        self
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_include_loader(mut self, include_loader: bool) -> Self {
        self.include_loader = include_loader;
        self
    }

    /// Requested segments, defaulting to all `num_segments`.
    pub fn segments_or_all(&self, num_segments: u32) -> SegmentSet {
        match &self.segments {
            Some(segments) => segments.clone(),
            None => (0..num_segments).collect(),
        }
    }

    pub fn is_excluded(&self, key: &K) -> bool {
        self.excluded_keys
            .as_ref()
            .map(|excluded| excluded.contains(key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request: PublisherRequest<u32> = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce)
            .with_segments([1, 2].into())
            .with_parallel(true)
            .with_excluded_keys([7].into());

        assert_eq!(request.segments_or_all(8), [1, 2].into());
        assert!(request.parallel);
        assert!(request.is_excluded(&7));
        assert!(!request.is_excluded(&8));
    }

    #[test]
    fn test_defaults_to_all_segments() {
        let request: PublisherRequest<u32> = PublisherRequest::new(DeliveryGuarantee::AtMostOnce)
            .with_excluded_keys(HashSet::new());
        assert_eq!(request.segments_or_all(3), [0, 1, 2].into());
        assert!(request.excluded_keys.is_none());
    }
}
