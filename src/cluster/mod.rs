//! Cluster-wide reductions and streaming publishers.
//!
//! The [`ClusterPublisherManager`] splits a request by owner, runs the
//! local share through the local manager and sends one command per remote
//! owner. Shares reported suspected are resolved again, against a newer
//! topology, until nothing is left.

mod partition;
mod reduction;
mod streaming;
mod subscription;
mod targets;

pub use partition::{AvailabilityMode, PartitionAwareClusterPublisherManager};
pub use streaming::ClusterPublisher;
pub use subscription::InnerPublisherSubscription;

use crate::command::{
    Collation, CommandDispatcher, CommandReply, PublisherCommand, PublisherTransport, Transformation,
};
use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::functions::{Collator, Finalizer, Transformer};
use crate::local::LocalPublisherManager;
use crate::metrics::PublisherMetrics;
use crate::partitioning::KeyPartitioner;
use crate::reducers;
use crate::request::PublisherRequest;
use crate::topology::{CacheTopology, TopologyOracle};
use crate::types::{CacheEntry, CacheKey, CacheValue, DeliveryGuarantee, NodeId, RequestId, SegmentSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use targets::TargetResolver;
use tracing::info;

/// Runs reductions and publishers over the whole cluster.
pub struct ClusterPublisherManager<K: CacheKey, V: CacheValue, T> {
    inner: Arc<Inner<K, V, T>>,
}

impl<K: CacheKey, V: CacheValue, T> Clone for ClusterPublisherManager<K, V, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<K: CacheKey, V: CacheValue, T> {
    config: PublisherConfig,
    local: Arc<LocalPublisherManager<K, V>>,
    /// Serves the streaming commands addressed to this node.
    dispatcher: Arc<CommandDispatcher<K, V>>,
    transport: Arc<T>,
    topology: Arc<dyn TopologyOracle>,
    partitioner: Arc<dyn KeyPartitioner<K>>,
    metrics: Arc<PublisherMetrics>,
    request_sequence: AtomicU64,
    running: AtomicBool,
}

impl<K, V, T> ClusterPublisherManager<K, V, T>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
{
    /// Create a manager on top of this node's dispatcher.
    pub fn new(dispatcher: Arc<CommandDispatcher<K, V>>, transport: Arc<T>) -> Result<Self> {
        let local = dispatcher.local().clone();
        let config = local.config().clone();
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                topology: local.topology().clone(),
                partitioner: local.partitioner().clone(),
                metrics: local.metrics().clone(),
                config,
                local,
                dispatcher,
                transport,
                request_sequence: AtomicU64::new(0),
                running: AtomicBool::new(true),
            }),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    pub fn local_node(&self) -> NodeId {
        self.inner.local_node()
    }

    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.inner.metrics
    }

    /// Reduce the keys selected by `request` across the cluster.
    ///
    /// `collator` runs on every target, `finalizer` combines the partial
    /// values on this node as they arrive.
    pub async fn key_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<K, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R> {
        self.inner
            .reduction(request, Collation::Keys(collator), finalizer)
            .await
    }

    /// Reduce the entries selected by `request` across the cluster.
    pub async fn entry_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<CacheEntry<K, V>, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R> {
        self.inner
            .reduction(request, Collation::Entries(collator), finalizer)
            .await
    }

    /// Count the entries of `segments`, or of the whole cache.
    pub async fn size(&self, segments: Option<SegmentSet>, include_loader: bool) -> Result<u64> {
        let mut request =
            PublisherRequest::new(DeliveryGuarantee::ExactlyOnce).with_include_loader(include_loader);
        if let Some(segments) = segments {
            request = request.with_segments(segments);
        }
        self.key_reduction(request, reducers::count(), reducers::add()).await
    }

    /// Stream the keys selected by `request`, `batch_size` values per round
    /// trip.
    pub fn key_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        batch_size: usize,
        transformer: Transformer<K, R>,
    ) -> ClusterPublisher<R> {
        streaming::publisher(
            self.inner.clone(),
            request,
            batch_size,
            Transformation::Keys(transformer),
        )
    }

    /// Stream the entries selected by `request`.
    pub fn entry_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        batch_size: usize,
        transformer: Transformer<CacheEntry<K, V>, R>,
    ) -> ClusterPublisher<R> {
        streaming::publisher(
            self.inner.clone(),
            request,
            batch_size,
            Transformation::Entries(transformer),
        )
    }

    /// Reject further operations.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!(node = self.local_node(), "cluster publisher manager stopped");
        }
    }
}

impl<K, V, T> Inner<K, V, T>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
{
    fn local_node(&self) -> NodeId {
        self.topology.local_node()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::LifecycleStopped)
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new(
            self.local_node(),
            self.request_sequence.fetch_add(1, Ordering::SeqCst),
        )
    }

    fn resolver<'a>(&'a self, topology: &'a CacheTopology) -> TargetResolver<'a, K> {
        TargetResolver {
            config: &self.config,
            topology,
            local: self.local_node(),
            partitioner: self.partitioner.as_ref(),
        }
    }

    /// Send `command` to `target`, serving it in-process when the target is
    /// this node.
    async fn invoke<R: Send + 'static>(
        &self,
        target: NodeId,
        command: PublisherCommand<K, V, R>,
        timeout: Duration,
    ) -> Result<CommandReply<K, R>> {
        let local = self.local_node();
        if target == local {
            return self.dispatcher.dispatch(Some(local), command).await;
        }

        self.metrics.remote_commands.inc();
        tokio::time::timeout(timeout, self.transport.invoke(target, command)).await?
    }
}
