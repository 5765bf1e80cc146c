//! The storage-facing side of a local scan.

use crate::types::{CacheEntry, CacheKey, CacheValue, SegmentId, SegmentSet};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

/// Supplies the entries physically present on this node.
///
/// Streams are lazy; nothing is read until they are polled.
pub trait SegmentSource<K: CacheKey, V: CacheValue>: Send + Sync + 'static {
    /// Entries of one segment.
    fn segment(&self, segment: SegmentId, include_loader: bool) -> BoxStream<'static, CacheEntry<K, V>>;

    /// Entries of several segments in one pass.
    ///
    /// Sources without per-segment indexes override this to avoid a full
    /// scan per segment.
    fn segments(&self, segments: &SegmentSet, include_loader: bool) -> BoxStream<'static, CacheEntry<K, V>> {
        let streams: Vec<_> = segments
            .iter()
            .map(|&segment| self.segment(segment, include_loader))
            .collect();
        stream::iter(streams).flatten().boxed()
    }

    /// Look up a single entry, possibly from a backing store.
    fn get(&self, key: &K, include_loader: bool) -> BoxFuture<'static, Option<CacheEntry<K, V>>>;

    /// Whether reading one segment is cheaper than reading all of them.
    fn is_segmented(&self) -> bool {
        true
    }
}
