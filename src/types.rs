//! Core types shared by the local and clustered publishers.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// A fixed partition of the key space, in `[0, num_segments)`.
pub type SegmentId = u32;

/// An ordered set of segments.
pub type SegmentSet = BTreeSet<SegmentId>;

/// Every segment in `[0, num_segments)`.
pub fn all_segments(num_segments: u32) -> SegmentSet {
    (0..num_segments).collect()
}

/// Bounds required of cache keys.
pub trait CacheKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Bounds required of cache values.
pub trait CacheValue: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// A key/value pair physically present on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> CacheEntry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Completeness contract for a scan under concurrent ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryGuarantee {
    /// Data from segments that move mid-scan may be silently dropped.
    AtMostOnce = 0,
    /// All data is returned, possibly duplicated across a topology change.
    AtLeastOnce = 1,
    /// Each entry is returned exactly once.
    ExactlyOnce = 2,
}

impl DeliveryGuarantee {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DeliveryGuarantee {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeliveryGuarantee::AtMostOnce),
            1 => Ok(DeliveryGuarantee::AtLeastOnce),
            2 => Ok(DeliveryGuarantee::ExactlyOnce),
            other => Err(Error::UnsupportedDeliveryGuarantee(other)),
        }
    }
}

impl fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryGuarantee::AtMostOnce => "AT_MOST_ONCE",
            DeliveryGuarantee::AtLeastOnce => "AT_LEAST_ONCE",
            DeliveryGuarantee::ExactlyOnce => "EXACTLY_ONCE",
        };
        f.write_str(name)
    }
}

/// Identifies a streaming session on the node serving it.
///
/// Unique per originating node: `origin#sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub origin: NodeId,
    pub sequence: u64,
}

impl RequestId {
    pub fn new(origin: NodeId, sequence: u64) -> Self {
        Self { origin, sequence }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.sequence)
    }
}

/// Selects what a local scan produces from each stored entry.
///
/// Implemented by the [`Keys`] and [`Entries`] markers.
pub trait PublisherMode<K: CacheKey, V: CacheValue>: Send + Sync + 'static {
    /// The element type handed to transformers and collators.
    type Item: Clone + fmt::Debug + Send + Sync + 'static;

    /// Whether the items carry values.
    const ENTRIES: bool;

    fn project(entry: CacheEntry<K, V>) -> Self::Item;

    fn key_of(item: &Self::Item) -> &K;
}

/// Scan keys only.
#[derive(Debug)]
pub enum Keys {}

/// Scan key/value entries.
#[derive(Debug)]
pub enum Entries {}

impl<K: CacheKey, V: CacheValue> PublisherMode<K, V> for Keys {
    type Item = K;
    const ENTRIES: bool = false;

    fn project(entry: CacheEntry<K, V>) -> K {
        entry.key
    }

    fn key_of(item: &K) -> &K {
        item
    }
}

impl<K: CacheKey, V: CacheValue> PublisherMode<K, V> for Entries {
    type Item = CacheEntry<K, V>;
    const ENTRIES: bool = true;

    fn project(entry: CacheEntry<K, V>) -> CacheEntry<K, V> {
        entry
    }

    fn key_of(item: &CacheEntry<K, V>) -> &K {
        &item.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_guarantee_decoding() {
        for guarantee in [
            DeliveryGuarantee::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce,
            DeliveryGuarantee::ExactlyOnce,
        ] {
            assert_eq!(DeliveryGuarantee::try_from(guarantee.as_u8()).unwrap(), guarantee);
        }

        let err = DeliveryGuarantee::try_from(3).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDeliveryGuarantee(3)));
    }

    #[test]
    fn test_request_id_display() {
        let id = RequestId::new(4, 17);
        assert_eq!(id.to_string(), "4#17");
    }

    #[test]
    fn test_modes_project_entries() {
        let entry = CacheEntry::new("k".to_string(), 5u32);
        let key = <Keys as PublisherMode<String, u32>>::project(entry.clone());
        assert_eq!(key, "k");
        assert_eq!(<Entries as PublisherMode<String, u32>>::key_of(&entry), "k");
        assert!(<Entries as PublisherMode<String, u32>>::ENTRIES);
    }

    #[test]
    fn test_all_segments() {
        let segments = all_segments(4);
        assert_eq!(segments.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
