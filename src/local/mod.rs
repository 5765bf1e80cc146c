//! Node-local reductions and publishers.
//!
//! The [`LocalPublisherManager`] reads the entries stored on this node and
//! either reduces them to a value or streams them with per-segment
//! completion notifications. Ownership changes reach running scans through
//! [`LocalPublisherManager::segments_lost`].

mod listener;
mod parallel;
mod publisher;
mod reduction;

pub use listener::{ListenerGuard, SegmentListenerRegistry, SegmentLossListener, SegmentTracker};
pub use publisher::SegmentAwarePublisher;

use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::functions::{Collator, Finalizer, Transformer};
use crate::metrics::PublisherMetrics;
use crate::partitioning::KeyPartitioner;
use crate::request::PublisherRequest;
use crate::result::PublisherResult;
use crate::source::SegmentSource;
use crate::topology::TopologyOracle;
use crate::types::{CacheEntry, CacheKey, CacheValue, Entries, Keys, PublisherMode, SegmentSet};
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Executes reductions and publishers over the entries of this node.
pub struct LocalPublisherManager<K: CacheKey, V: CacheValue> {
    config: PublisherConfig,

    /// Entries physically present on this node.
    source: Arc<dyn SegmentSource<K, V>>,

    /// Ownership as seen from this node.
    topology: Arc<dyn TopologyOracle>,

    /// Maps keys to segments.
    partitioner: Arc<dyn KeyPartitioner<K>>,

    /// Trackers of in-flight scans.
    listeners: SegmentListenerRegistry,

    metrics: Arc<PublisherMetrics>,

    running: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> LocalPublisherManager<K, V> {
    pub fn new(
        config: PublisherConfig,
        source: Arc<dyn SegmentSource<K, V>>,
        topology: Arc<dyn TopologyOracle>,
        partitioner: Arc<dyn KeyPartitioner<K>>,
        metrics: Arc<PublisherMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            topology,
            partitioner,
            listeners: SegmentListenerRegistry::new(),
            metrics,
            running: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<dyn TopologyOracle> {
        &self.topology
    }

    pub fn partitioner(&self) -> &Arc<dyn KeyPartitioner<K>> {
        &self.partitioner
    }

    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.metrics
    }

    /// Reduce the keys selected by `request`.
    ///
    /// The result carries the segments this node stopped owning before
    /// their contribution was final, if any.
    pub async fn key_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<K, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>> {
        self.reduce::<Keys, R>(request, collator, finalizer).await
    }

    /// Reduce the entries selected by `request`.
    pub async fn entry_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<CacheEntry<K, V>, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>> {
        self.reduce::<Entries, R>(request, collator, finalizer).await
    }

    /// Stream the keys selected by `request` through `transformer`.
    pub fn key_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        transformer: Transformer<K, R>,
    ) -> SegmentAwarePublisher<R> {
        self.publisher::<Keys, R>(request, transformer)
    }

    /// Stream the entries selected by `request` through `transformer`.
    pub fn entry_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        transformer: Transformer<CacheEntry<K, V>, R>,
    ) -> SegmentAwarePublisher<R> {
        self.publisher::<Entries, R>(request, transformer)
    }

    /// Notify every in-flight scan that `segments` are no longer read-owned
    /// locally.
    pub fn segments_lost(&self, segments: &SegmentSet) {
        if segments.is_empty() {
            return;
        }
        debug!(?segments, scans = self.listeners.len(), "segments lost");
        self.metrics.segments_lost.inc_by(segments.len() as u64);
        self.listeners.notify_lost(segments);
    }

    /// Reject further operations. Running scans are not interrupted.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(node = self.topology.local_node(), "local publisher manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::LifecycleStopped)
        }
    }

    /// The requested keys that pass the exclusion and segment filters.
    fn requested_keys(&self, request: &PublisherRequest<K>, keys: &HashSet<K>) -> Vec<K> {
        keys.iter()
            .filter(|key| !request.is_excluded(key))
            .filter(|key| match &request.segments {
                Some(segments) => segments.contains(&self.partitioner.segment_of(key)),
                None => true,
            })
            .cloned()
            .collect()
    }
}

/// Project stored entries to the items of mode `M`, skipping `excluded`.
pub(crate) fn project<K, V, M>(
    entries: BoxStream<'static, CacheEntry<K, V>>,
    excluded: Option<Arc<HashSet<K>>>,
) -> BoxStream<'static, M::Item>
where
    K: CacheKey,
    V: CacheValue,
    M: PublisherMode<K, V>,
{
    match excluded {
        None => entries.map(M::project).boxed(),
        Some(excluded) => entries
            .filter(move |entry| future::ready(!excluded.contains(&entry.key)))
            .map(M::project)
            .boxed(),
    }
}

/// Look up `keys` one by one, skipping absent entries.
pub(crate) fn lookup<K, V, M>(
    source: Arc<dyn SegmentSource<K, V>>,
    keys: Vec<K>,
    include_loader: bool,
) -> BoxStream<'static, M::Item>
where
    K: CacheKey,
    V: CacheValue,
    M: PublisherMode<K, V>,
{
    stream::iter(keys)
        .then(move |key| source.get(&key, include_loader))
        .filter_map(|entry| future::ready(entry.map(M::project)))
        .boxed()
}
