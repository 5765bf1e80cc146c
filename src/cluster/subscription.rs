//! Client side pull driver of the batched streaming protocol.

use super::Inner;
use crate::command::{
    CancelPublisherCommand, CommandReply, InitialPublisherCommand, NextPublisherCommand,
    PublisherCommand, PublisherTransport, Transformation,
};
use crate::error::Result;
use crate::request::PublisherRequest;
use crate::types::{CacheKey, CacheValue, DeliveryGuarantee, NodeId, RequestId, SegmentId, SegmentSet};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// One node and the part of the request it serves.
#[derive(Debug, Clone)]
pub(crate) struct StreamTarget<K> {
    pub(crate) node: NodeId,
    pub(crate) segments: SegmentSet,
    pub(crate) keys: Option<HashSet<K>>,
    pub(crate) guarantee: DeliveryGuarantee,
}

/// Targets of one round, shared by every subscription of the round.
pub(crate) struct TargetSupplier<K> {
    targets: Mutex<VecDeque<StreamTarget<K>>>,
}

impl<K> TargetSupplier<K> {
    pub(crate) fn new(targets: impl IntoIterator<Item = StreamTarget<K>>) -> Self {
        Self {
            targets: Mutex::new(targets.into_iter().collect()),
        }
    }

    fn next(&self) -> Option<StreamTarget<K>> {
        self.targets.lock().pop_front()
    }
}

/// What a subscription observed from its targets.
#[derive(Debug)]
pub(crate) enum InnerEvent<K, R> {
    Value { value: R, segment: SegmentId },
    /// Source keys whose values were all delivered.
    Keys(Vec<K>),
    Complete(SegmentId),
    Lost(SegmentId),
    /// The target left before completing these segments.
    Abandoned { node: NodeId, segments: SegmentSet },
}

/// Walks targets from a shared supplier, one at a time, pulling batches
/// with the initial and next commands.
///
/// A batch is requested only once the previous one was fully consumed. A
/// target that becomes unavailable is skipped, leaving its unfinished
/// segments to the caller. Dropping the stream while a session is open
/// sends a cancel command to its target.
pub struct InnerPublisherSubscription<K: CacheKey, V: CacheValue, T, R> {
    inner: Arc<Inner<K, V, T>>,
    supplier: Arc<TargetSupplier<K>>,
    request: PublisherRequest<K>,
    transformation: Transformation<K, V, R>,
    batch_size: usize,
    track_keys: bool,
}

impl<K, V, T, R> InnerPublisherSubscription<K, V, T, R>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
    R: Send + 'static,
{
    pub(crate) fn new(
        inner: Arc<Inner<K, V, T>>,
        supplier: Arc<TargetSupplier<K>>,
        request: PublisherRequest<K>,
        transformation: Transformation<K, V, R>,
        batch_size: usize,
        track_keys: bool,
    ) -> Self {
        Self {
            inner,
            supplier,
            request,
            transformation,
            batch_size: batch_size.max(1),
            track_keys,
        }
    }

    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<InnerEvent<K, R>>> {
        let Self {
            inner,
            supplier,
            request,
            transformation,
            batch_size,
            track_keys,
        } = self;
        let timeout = inner.config.streaming_timeout();

        let events = stream! {
            while let Some(target) = supplier.next() {
                let node = target.node;
                let request_id = inner.next_request_id();
                let mut request = request.clone().with_segments(target.segments.clone());
                request.keys = target.keys;
                request.guarantee = target.guarantee;
                trace!(%request_id, node, segments = ?request.segments, "opening publisher");

                let command = PublisherCommand::Initial(InitialPublisherCommand {
                    request_id: request_id.clone(),
                    request,
                    batch_size,
                    track_keys,
                    transformation: transformation.clone(),
                });
                let mut cancel = CancelGuard::new(inner.clone(), node, request_id.clone());
                let mut reply = inner.invoke(node, command, timeout).await;
                let mut pending = target.segments;

                loop {
                    let mut response = match reply.and_then(CommandReply::into_batch) {
                        Ok(response) => response,
                        Err(err) if err.is_target_unavailable() => {
                            debug!(%request_id, node, error = %err, "target unavailable");
                            cancel.disarm();
                            yield Ok(InnerEvent::Abandoned { node, segments: pending });
                            break;
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    };

                    let complete = response.complete;
                    let keys = std::mem::take(&mut response.keys);
                    let completed = std::mem::take(&mut response.completed_segments);
                    let lost = std::mem::take(&mut response.lost_segments);
                    let values = match response.into_tagged_values() {
                        Ok(values) => values,
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    };

                    for (value, segment) in values {
                        yield Ok(InnerEvent::Value { value, segment });
                    }
                    if !keys.is_empty() {
                        yield Ok(InnerEvent::Keys(keys));
                    }
                    for segment in completed {
                        pending.remove(&segment);
                        yield Ok(InnerEvent::Complete(segment));
                    }
                    for segment in lost {
                        pending.remove(&segment);
                        yield Ok(InnerEvent::Lost(segment));
                    }

                    if complete {
                        cancel.disarm();
                        trace!(%request_id, node, "publisher exhausted");
                        break;
                    }
                    let next = PublisherCommand::Next(NextPublisherCommand {
                        request_id: request_id.clone(),
                        batch_size,
                    });
                    reply = inner.invoke(node, next, timeout).await;
                }
            }
        };
        events.boxed()
    }
}

/// Sends a cancel command for an open session when dropped armed.
struct CancelGuard<K: CacheKey, V: CacheValue, T: PublisherTransport<K, V>> {
    inner: Arc<Inner<K, V, T>>,
    node: NodeId,
    request_id: RequestId,
    armed: bool,
}

impl<K: CacheKey, V: CacheValue, T: PublisherTransport<K, V>> CancelGuard<K, V, T> {
    fn new(inner: Arc<Inner<K, V, T>>, node: NodeId, request_id: RequestId) -> Self {
        Self {
            inner,
            node,
            request_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K: CacheKey, V: CacheValue, T: PublisherTransport<K, V>> Drop for CancelGuard<K, V, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let inner = self.inner.clone();
        let node = self.node;
        let request_id = self.request_id.clone();
        debug!(%request_id, node, "cancelling remote publisher");
        runtime.spawn(async move {
            let command = PublisherCommand::<K, V, ()>::Cancel(CancelPublisherCommand { request_id });
            let timeout = inner.config.remote_timeout;
            if let Err(err) = inner.invoke(node, command, timeout).await {
                trace!(node, error = %err, "cancel not delivered");
            }
        });
    }
}
