//! Local reduction strategies, one per delivery guarantee.

use super::listener::SegmentTracker;
use super::parallel::{self, SegmentWork};
use super::{lookup, project, LocalPublisherManager};
use crate::error::Result;
use crate::functions::{Collator, Finalizer};
use crate::request::PublisherRequest;
use crate::result::PublisherResult;
use crate::types::{CacheKey, CacheValue, DeliveryGuarantee, PublisherMode, SegmentSet};
use futures::stream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

impl<K: CacheKey, V: CacheValue> LocalPublisherManager<K, V> {
    pub(super) async fn reduce<M, R>(
        &self,
        request: PublisherRequest<K>,
        collator: Collator<M::Item, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        self.ensure_running()?;
        self.metrics.local_reductions.inc();

        if let Some(keys) = &request.keys {
            let keys = self.requested_keys(&request, keys);
            return self.reduce_keys::<M, R>(&request, keys, collator, finalizer).await;
        }

        let segments = request.segments_or_all(self.config.num_segments);
        trace!(
            guarantee = %request.guarantee,
            parallel = request.parallel,
            segments = segments.len(),
            "local reduction"
        );

        match request.guarantee {
            DeliveryGuarantee::AtMostOnce => {
                let value = self
                    .at_most_once::<M, R>(&request, segments, collator, finalizer)
                    .await?;
                Ok(PublisherResult::value(value))
            }
            DeliveryGuarantee::AtLeastOnce => {
                let tracker = self.track(&segments);
                let _guard = self.listeners.register(tracker.clone());
                tracker.verify_topology(&self.topology.current(), self.topology.local_node());

                let value = self
                    .at_most_once::<M, R>(&request, segments, collator, finalizer)
                    .await?;
                Ok(PublisherResult::with_suspected_segments(Some(value), tracker.lost()))
            }
            DeliveryGuarantee::ExactlyOnce if self.source.is_segmented() => {
                self.exactly_once_segmented::<M, R>(&request, segments, collator, finalizer)
                    .await
            }
            DeliveryGuarantee::ExactlyOnce => {
                self.exactly_once_whole::<M, R>(&request, segments, collator, finalizer)
                    .await
            }
        }
    }

    fn track(&self, segments: &SegmentSet) -> Arc<SegmentTracker> {
        Arc::new(SegmentTracker::new(segments.clone()))
    }

    async fn at_most_once<M, R>(
        &self,
        request: &PublisherRequest<K>,
        segments: SegmentSet,
        collator: Collator<M::Item, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        if request.parallel {
            let work = self.segment_work::<M, R>(request, collator, None);
            return parallel::run_segments(segments, self.config.parallelism, work, &finalizer).await;
        }

        let items = project::<K, V, M>(
            self.source.segments(&segments, request.include_loader),
            excluded(request),
        );
        collator.collate(items).await
    }

    /// Collate segment by segment, discarding the value of any segment
    /// lost before its collation completed.
    async fn exactly_once_segmented<M, R>(
        &self,
        request: &PublisherRequest<K>,
        segments: SegmentSet,
        collator: Collator<M::Item, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        let tracker = self.track(&segments);
        let _guard = self.listeners.register(tracker.clone());
        tracker.verify_topology(&self.topology.current(), self.topology.local_node());

        let workers = if request.parallel { self.config.parallelism } else { 1 };
        let work = self.segment_work::<M, R>(request, collator, Some(tracker.clone()));
        let value = parallel::run_segments(segments, workers, work, &finalizer).await?;

        let lost = tracker.lost();
        if !lost.is_empty() {
            debug!(?lost, "segments lost during reduction");
        }
        Ok(PublisherResult::with_suspected_segments(Some(value), lost))
    }

    /// One pass over every requested segment. Any loss suspects them all.
    async fn exactly_once_whole<M, R>(
        &self,
        request: &PublisherRequest<K>,
        segments: SegmentSet,
        collator: Collator<M::Item, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        let tracker = self.track(&segments);
        let _guard = self.listeners.register(tracker.clone());
        tracker.verify_topology(&self.topology.current(), self.topology.local_node());
        if tracker.has_losses() {
            return Ok(PublisherResult::with_suspected_segments(None, segments));
        }

        let items = project::<K, V, M>(
            self.source.segments(&segments, request.include_loader),
            excluded(request),
        );
        let value = if request.parallel {
            let partials: Vec<R> = items
                .chunks(self.config.non_segmented_batch.max(1))
                .map(|chunk| collator.collate_iter(chunk))
                .buffer_unordered(self.config.parallelism.max(1))
                .try_collect()
                .await?;
            finalizer.collate_iter(partials).await?
        } else {
            collator.collate(items).await?
        };

        if tracker.has_losses() {
            debug!(segments = segments.len(), "whole-store scan lost segments, suspecting all");
            return Ok(PublisherResult::with_suspected_segments(None, segments));
        }
        Ok(PublisherResult::value(value))
    }

    /// Reduce specific keys. Key reductions never report suspicion.
    async fn reduce_keys<M, R>(
        &self,
        request: &PublisherRequest<K>,
        keys: Vec<K>,
        collator: Collator<M::Item, R>,
        finalizer: Finalizer<R>,
    ) -> Result<PublisherResult<K, R>>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        let include_loader = request.include_loader;
        let value = if request.parallel {
            let window = self.config.key_window.max(1);
            let windows: Vec<Vec<K>> = keys.chunks(window).map(<[K]>::to_vec).collect();
            let partials: Vec<R> = stream::iter(windows)
                .map(|window| {
                    collator.collate(lookup::<K, V, M>(self.source.clone(), window, include_loader))
                })
                .buffer_unordered(self.config.parallelism.max(1))
                .try_collect()
                .await?;
            finalizer.collate_iter(partials).await?
        } else {
            collator
                .collate(lookup::<K, V, M>(self.source.clone(), keys, include_loader))
                .await?
        };
        Ok(PublisherResult::value(value))
    }

    /// Per-segment collation for the work-stealing runner.
    ///
    /// With a tracker, a segment already lost is skipped and a segment lost
    /// while collating has its value discarded.
    fn segment_work<M, R>(
        &self,
        request: &PublisherRequest<K>,
        collator: Collator<M::Item, R>,
        tracker: Option<Arc<SegmentTracker>>,
    ) -> SegmentWork<R>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        let source = self.source.clone();
        let excluded = excluded(request);
        let include_loader = request.include_loader;

        Arc::new(move |segment| {
            let source = source.clone();
            let excluded = excluded.clone();
            let collator = collator.clone();
            let tracker = tracker.clone();
            async move {
                if let Some(tracker) = &tracker {
                    if tracker.is_lost(segment) {
                        tracker.finish(segment);
                        return Ok(None);
                    }
                }

                let items = project::<K, V, M>(source.segment(segment, include_loader), excluded);
                let value = collator.collate(items).await?;

                match &tracker {
                    Some(tracker) if !tracker.finish(segment) => {
                        trace!(segment, "discarding value of lost segment");
                        Ok(None)
                    }
                    _ => Ok(Some(value)),
                }
            }
            .boxed()
        })
    }
}

fn excluded<K: CacheKey>(request: &PublisherRequest<K>) -> Option<Arc<HashSet<K>>> {
    request.excluded_keys.clone().map(Arc::new)
}
