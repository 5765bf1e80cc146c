//! Cluster-wide streaming publishers.

use super::subscription::{InnerEvent, InnerPublisherSubscription, StreamTarget, TargetSupplier};
use super::targets::{delivery_to_use, Share};
use super::Inner;
use crate::command::{PublisherTransport, Transformation};
use crate::error::Result;
use crate::notification::Notification;
use crate::partitioning::KeyPartitioner;
use crate::request::PublisherRequest;
use crate::types::{CacheKey, CacheValue, DeliveryGuarantee, SegmentId, SegmentSet};
use async_stream::stream;
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Values streamed from every owner, tagged with their segment.
///
/// Each requested segment is completed exactly once, after its last
/// value. Segments that move while being read are read again from their
/// new owner; under `ExactlyOnce` values already delivered are skipped.
pub struct ClusterPublisher<R> {
    notifications: BoxStream<'static, Result<Notification<R>>>,
}

impl<R: Send + 'static> ClusterPublisher<R> {
    pub(crate) fn new(notifications: BoxStream<'static, Result<Notification<R>>>) -> Self {
        Self { notifications }
    }

    /// Values and segment completions.
    pub fn notifications(self) -> BoxStream<'static, Result<Notification<R>>> {
        self.notifications
    }

    pub fn values(self) -> BoxStream<'static, Result<R>> {
        self.notifications
            .filter_map(|notification| {
                future::ready(match notification {
                    Ok(notification) => notification.into_value().map(Ok),
                    Err(err) => Some(Err(err)),
                })
            })
            .boxed()
    }
}

pub(super) fn publisher<K, V, T, R>(
    inner: Arc<Inner<K, V, T>>,
    request: PublisherRequest<K>,
    batch_size: usize,
    transformation: Transformation<K, V, R>,
) -> ClusterPublisher<R>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
    R: Send + 'static,
{
    let notifications = stream! {
        if let Err(err) = inner.ensure_running() {
            yield Err(err);
            return;
        }
        inner.metrics.publishers_started.inc();

        let guarantee = request.guarantee;
        let track_keys = guarantee == DeliveryGuarantee::ExactlyOnce;
        let mut session = StreamingSession::new(&inner, &request);
        let mut last_topology = None;

        while !session.pending.is_empty() {
            let topology = inner.topology.current();
            if last_topology == Some(topology.id()) {
                trace!(topology_id = topology.id(), "waiting for a newer topology");
                inner.topology.topology_future(topology.id() + 1).await;
                continue;
            }
            last_topology = Some(topology.id());

            let targets = inner
                .resolver(&topology)
                .resolve_segments(session.pending.clone(), request.include_loader);
            if targets.by_node.is_empty() {
                debug!(topology_id = topology.id(), "no owners for pending segments");
                continue;
            }

            let local = inner.local_node();
            let mut round: Vec<StreamTarget<K>> = targets
                .by_node
                .into_iter()
                .filter_map(|(node, share)| match share {
                    Share::Segments(segments) => Some(StreamTarget {
                        node,
                        keys: session.keys_in(&segments),
                        segments,
                        guarantee: delivery_to_use(&inner.config, &request, node, local),
                    }),
                    Share::Keys(_) => None,
                })
                .collect();
            // local work is claimed last
            round.sort_by_key(|target| target.node == local);

            let concurrent = inner.config.max_inner_subscribers.max(1).min(round.len());
            let per_subscription = batch_size.max(1).div_ceil(concurrent);
            let round_request = session.round_request(&request);
            debug!(
                topology_id = topology.id(),
                targets = round.len(),
                concurrent,
                pending = session.pending.len(),
                "streaming round"
            );

            let supplier = Arc::new(TargetSupplier::new(round));
            let subscriptions = (0..concurrent).map(|_| {
                InnerPublisherSubscription::new(
                    inner.clone(),
                    supplier.clone(),
                    round_request.clone(),
                    transformation.clone(),
                    per_subscription,
                    track_keys,
                )
                .into_stream()
            });
            let mut events = stream::select_all(subscriptions);

            while let Some(event) = events.next().await {
                match event {
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                    Ok(InnerEvent::Value { value, segment }) => {
                        yield Ok(Notification::value(value, segment));
                    }
                    Ok(InnerEvent::Keys(keys)) => session.record_keys(keys),
                    Ok(InnerEvent::Complete(segment)) => {
                        if session.complete(segment) {
                            yield Ok(Notification::SegmentComplete(segment));
                        }
                    }
                    Ok(InnerEvent::Lost(segment)) => {
                        trace!(segment, "segment lost, will be read again");
                        if guarantee == DeliveryGuarantee::AtMostOnce {
                            session.abandon(segment);
                        }
                    }
                    Ok(InnerEvent::Abandoned { node, segments }) => {
                        debug!(node, ?segments, "target left during streaming");
                        if guarantee == DeliveryGuarantee::AtMostOnce {
                            segments.into_iter().for_each(|segment| session.abandon(segment));
                        }
                    }
                }
            }

            if !session.pending.is_empty() {
                inner.metrics.retries.inc();
                inner.metrics.suspected_segments.inc_by(session.pending.len() as u64);
            }
        }
    };
    ClusterPublisher::new(notifications.boxed())
}

/// Progress of one streaming publisher across rounds.
struct StreamingSession<K: CacheKey> {
    /// Segments not yet completed.
    pending: SegmentSet,
    /// Requested keys per segment, for key based requests.
    requested_keys: Option<HashMap<SegmentId, HashSet<K>>>,
    /// Keys already delivered for pending segments.
    delivered: HashMap<SegmentId, HashSet<K>>,
    partitioner: Arc<dyn KeyPartitioner<K>>,
}

impl<K: CacheKey> StreamingSession<K> {
    fn new<V: CacheValue, T>(inner: &Inner<K, V, T>, request: &PublisherRequest<K>) -> Self {
        let partitioner = inner.partitioner.clone();
        let (pending, requested_keys) = match &request.keys {
            Some(keys) => {
                let mut by_segment: HashMap<SegmentId, HashSet<K>> = HashMap::new();
                for key in keys.iter().filter(|key| !request.is_excluded(key)) {
                    let segment = partitioner.segment_of(key);
                    let wanted = request
                        .segments
                        .as_ref()
                        .map_or(true, |segments| segments.contains(&segment));
                    if wanted {
                        by_segment.entry(segment).or_default().insert(key.clone());
                    }
                }
                (by_segment.keys().copied().collect(), Some(by_segment))
            }
            None => (request.segments_or_all(inner.config.num_segments), None),
        };

        Self {
            pending,
            requested_keys,
            delivered: HashMap::new(),
            partitioner,
        }
    }

    fn keys_in(&self, segments: &SegmentSet) -> Option<HashSet<K>> {
        let requested = self.requested_keys.as_ref()?;
        Some(
            segments
                .iter()
                .filter_map(|segment| requested.get(segment))
                .flatten()
                .cloned()
                .collect(),
        )
    }

    /// The request shared by a round: the caller's exclusions plus the keys
    /// already delivered for segments read again.
    fn round_request(&self, request: &PublisherRequest<K>) -> PublisherRequest<K> {
        let mut excluded: HashSet<K> = request.excluded_keys.clone().unwrap_or_default();
        for (segment, keys) in &self.delivered {
            if self.pending.contains(segment) {
                excluded.extend(keys.iter().cloned());
            }
        }
        let mut round = request.clone().with_excluded_keys(excluded);
        round.segments = None;
        round.keys = None;
        round
    }

    fn record_keys(&mut self, keys: Vec<K>) {
        for key in keys {
            let segment = self.partitioner.segment_of(&key);
            if self.pending.contains(&segment) {
                self.delivered.entry(segment).or_default().insert(key);
            }
        }
    }

    /// Returns whether `segment` was still pending.
    fn complete(&mut self, segment: SegmentId) -> bool {
        self.delivered.remove(&segment);
        self.pending.remove(&segment)
    }

    fn abandon(&mut self, segment: SegmentId) {
        self.delivered.remove(&segment);
        self.pending.remove(&segment);
    }
}
