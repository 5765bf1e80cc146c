//! Fail-fast behaviour while the cluster is partitioned.

use super::{ClusterPublisher, ClusterPublisherManager};
use crate::command::PublisherTransport;
use crate::error::{Error, Result};
use crate::functions::{Collator, Finalizer, Transformer};
use crate::request::PublisherRequest;
use crate::types::{CacheEntry, CacheKey, CacheValue, SegmentSet};
use async_stream::stream;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Availability of the cluster as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvailabilityMode {
    #[default]
    Available,
    /// Some segments may be unreachable; results could be inconsistent.
    Degraded,
}

#[derive(Default)]
struct Availability {
    mode: RwLock<AvailabilityMode>,
    next_id: AtomicU64,
    /// Operations in flight, cancelled when availability degrades.
    in_flight: DashMap<u64, CancellationToken>,
}

impl Availability {
    fn check(&self) -> Result<()> {
        match *self.mode.read() {
            AvailabilityMode::Available => Ok(()),
            AvailabilityMode::Degraded => Err(Error::PartitionDegraded),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlight {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.in_flight.insert(id, token.clone());
        InFlight {
            id,
            token,
            availability: self.clone(),
        }
    }
}

struct InFlight {
    id: u64,
    token: CancellationToken,
    availability: Arc<Availability>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.availability.in_flight.remove(&self.id);
    }
}

/// A [`ClusterPublisherManager`] that refuses to work, and aborts work in
/// flight, while the cluster is degraded.
pub struct PartitionAwareClusterPublisherManager<K: CacheKey, V: CacheValue, T> {
    manager: ClusterPublisherManager<K, V, T>,
    availability: Arc<Availability>,
}

impl<K, V, T> PartitionAwareClusterPublisherManager<K, V, T>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
{
    pub fn new(manager: ClusterPublisherManager<K, V, T>) -> Self {
        Self {
            manager,
            availability: Arc::new(Availability::default()),
        }
    }

    pub fn availability(&self) -> AvailabilityMode {
        *self.availability.mode.read()
    }

    /// Install a new availability mode. Degrading aborts every operation
    /// in flight.
    pub fn set_availability(&self, mode: AvailabilityMode) {
        let previous = std::mem::replace(&mut *self.availability.mode.write(), mode);
        if previous == mode {
            return;
        }
        info!(?previous, ?mode, "availability changed");

        if mode == AvailabilityMode::Degraded {
            let in_flight = self.availability.in_flight.len();
            if in_flight > 0 {
                warn!(in_flight, "aborting operations after partition");
            }
            for entry in self.availability.in_flight.iter() {
                entry.value().cancel();
            }
        }
    }

    pub async fn key_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<K, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R> {
        self.guarded(self.manager.key_reduction(request, collator, finalizer))
            .await
    }

    pub async fn entry_reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<CacheEntry<K, V>, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R> {
        self.guarded(self.manager.entry_reduction(request, collator, finalizer))
            .await
    }

    pub async fn size(&self, segments: Option<SegmentSet>, include_loader: bool) -> Result<u64> {
        self.guarded(self.manager.size(segments, include_loader)).await
    }

    pub fn key_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        batch_size: usize,
        transformer: Transformer<K, R>,
    ) -> ClusterPublisher<R> {
        let publisher = self.manager.key_publisher(request, batch_size, transformer);
        ClusterPublisher::new(self.guarded_stream(publisher.notifications()))
    }

    pub fn entry_publisher<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        batch_size: usize,
        transformer: Transformer<CacheEntry<K, V>, R>,
    ) -> ClusterPublisher<R> {
        let publisher = self.manager.entry_publisher(request, batch_size, transformer);
        ClusterPublisher::new(self.guarded_stream(publisher.notifications()))
    }

    pub fn inner(&self) -> &ClusterPublisherManager<K, V, T> {
        &self.manager
    }

    /// Run `operation` unless degraded, aborting it if availability
    /// degrades before it completes.
    async fn guarded<X>(&self, operation: impl Future<Output = Result<X>>) -> Result<X> {
        let in_flight = self.availability.enter();
        self.availability.check()?;

        tokio::select! {
            biased;
            _ = in_flight.token.cancelled() => Err(Error::PartitionDegraded),
            result = operation => {
                self.availability.check()?;
                result
            }
        }
    }

    fn guarded_stream<X: Send + 'static>(
        &self,
        mut items: BoxStream<'static, Result<X>>,
    ) -> BoxStream<'static, Result<X>> {
        let availability = self.availability.clone();
        let guarded = stream! {
            let in_flight = availability.enter();
            if let Err(err) = availability.check() {
                yield Err(err);
                return;
            }

            loop {
                let next = tokio::select! {
                    biased;
                    _ = in_flight.token.cancelled() => Err(Error::PartitionDegraded),
                    next = items.next() => Ok(next),
                };
                match next.and_then(|item| availability.check().map(|()| item)) {
                    Ok(Some(item)) => yield item,
                    Ok(None) => return,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        };
        guarded.boxed()
    }
}
