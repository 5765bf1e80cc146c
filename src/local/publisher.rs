//! Lazily evaluated local publishers with segment notifications.

use super::listener::SegmentTracker;
use super::{lookup, project, LocalPublisherManager};
use crate::error::{Error, Result};
use crate::functions::Transformer;
use crate::notification::Notification;
use crate::request::PublisherRequest;
use crate::types::{CacheKey, CacheValue, DeliveryGuarantee, PublisherMode, SegmentId};
use async_stream::stream;
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A local stream of transformed values, tagged with their segment and
/// interleaved with segment completion and loss notifications.
///
/// Nothing is read until the stream is polled. Every requested segment is
/// eventually reported complete or lost, after all of its values.
pub struct SegmentAwarePublisher<R> {
    notifications: BoxStream<'static, Result<Notification<R>>>,
}

impl<R: Send + 'static> SegmentAwarePublisher<R> {
    pub(crate) fn new(notifications: BoxStream<'static, Result<Notification<R>>>) -> Self {
        Self { notifications }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self::new(stream::once(future::ready(Err(err))).boxed())
    }

    /// Values, completions and losses.
    pub fn with_lost_segments(self) -> BoxStream<'static, Result<Notification<R>>> {
        self.notifications
    }

    /// Values and completions. Lost segments are silently skipped.
    pub fn with_segments(self) -> BoxStream<'static, Result<Notification<R>>> {
        self.notifications
            .filter(|notification| {
                future::ready(!matches!(notification, Ok(notification) if notification.is_lost()))
            })
            .boxed()
    }

    /// Values only.
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

impl<K: CacheKey, V: CacheValue> LocalPublisherManager<K, V> {
    pub(crate) fn publisher<M, R>(
        &self,
        request: PublisherRequest<K>,
        transformer: Transformer<M::Item, R>,
    ) -> SegmentAwarePublisher<R>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        if let Err(err) = self.ensure_running() {
            return SegmentAwarePublisher::failed(err);
        }
        if request.keys.is_some() {
            return self.key_lookup_publisher::<M, R>(request, transformer);
        }

        let segments = request.segments_or_all(self.config.num_segments);
        let excluded = request.excluded_keys.clone().map(Arc::new);
        let include_loader = request.include_loader;
        let tracked = request.guarantee != DeliveryGuarantee::AtMostOnce;
        let source = self.source.clone();
        let topology = self.topology.clone();
        let listeners = self.listeners.clone();

        let notifications = stream! {
            let tracker = tracked.then(|| Arc::new(SegmentTracker::new(segments.clone())));
            let _guard = tracker.as_ref().map(|tracker| listeners.register(tracker.clone()));
            if let Some(tracker) = &tracker {
                tracker.verify_topology(&topology.current(), topology.local_node());
            }

            for segment in segments {
                if let Some(tracker) = &tracker {
                    if tracker.is_lost(segment) {
                        tracker.finish(segment);
                        yield Ok(Notification::SegmentLost(segment));
                        continue;
                    }
                }

                let items = project::<K, V, M>(source.segment(segment, include_loader), excluded.clone());
                let mut values = transformer.apply(items);
                while let Some(value) = values.next().await {
                    match value {
                        Ok(value) => yield Ok(Notification::value(value, segment)),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }

                let intact = tracker.as_ref().map_or(true, |tracker| tracker.finish(segment));
                if intact {
                    yield Ok(Notification::SegmentComplete(segment));
                } else {
                    trace!(segment, "segment lost while publishing");
                    yield Ok(Notification::SegmentLost(segment));
                }
            }
        };
        SegmentAwarePublisher::new(notifications.boxed())
    }

    /// Publish specific keys grouped by segment, then complete the
    /// requested segments that had no keys.
    fn key_lookup_publisher<M, R>(
        &self,
        request: PublisherRequest<K>,
        transformer: Transformer<M::Item, R>,
    ) -> SegmentAwarePublisher<R>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        let keys: Vec<K> = request
            .keys
            .iter()
            .flatten()
            .filter(|key| !request.is_excluded(key))
            .cloned()
            .collect();
        let mut by_segment: BTreeMap<SegmentId, Vec<K>> = BTreeMap::new();
        for key in keys {
            by_segment
                .entry(self.partitioner.segment_of(&key))
                .or_default()
                .push(key);
        }
        let mut remaining = match &request.segments {
            Some(segments) => segments.clone(),
            None => by_segment.keys().copied().collect(),
        };
        let source = self.source.clone();
        let include_loader = request.include_loader;

        let notifications = stream! {
            for (segment, keys) in by_segment {
                if !remaining.remove(&segment) {
                    yield Err(Error::KeyOutsideSegments { segment });
                    return;
                }

                let mut values = transformer.apply(lookup::<K, V, M>(source.clone(), keys, include_loader));
                while let Some(value) = values.next().await {
                    match value {
                        Ok(value) => yield Ok(Notification::value(value, segment)),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }
                yield Ok(Notification::SegmentComplete(segment));
            }

            for segment in remaining {
                yield Ok(Notification::SegmentComplete(segment));
            }
        };
        SegmentAwarePublisher::new(notifications.boxed())
    }
}
