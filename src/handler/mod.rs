//! Server side of the batched pull protocol.
//!
//! ```text
//!   initial ──► register ──► producer task ──► BatchBuilder ──► slot ──► response
//!   next    ──► get_next ─────────────────────────────────────► slot ──► response
//!   cancel  ──► close_publisher ──► cancel producer, drop session
//! ```
//!
//! Each session runs one producer task pulling the local segment aware
//! publisher. A batch is handed over only once the element after it is
//! seen, so completions trailing the last value of a batch travel with it.
//! After handing over a batch the producer waits until the consumer takes
//! it before reading on.

mod state;

use crate::command::{InitialPublisherCommand, Transformation};
use crate::error::{Error, Result};
use crate::functions::Transformer;
use crate::local::LocalPublisherManager;
use crate::metrics::PublisherMetrics;
use crate::notification::Notification;
use crate::request::PublisherRequest;
use crate::result::PublisherResponse;
use crate::types::{CacheKey, CacheValue, DeliveryGuarantee, Entries, Keys, NodeId, PublisherMode, RequestId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use state::{BatchBuilder, Emission, Session, SessionState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

type EmissionStream<K, R> = BoxStream<'static, Result<Emission<K, R>>>;

/// Session table and batching for streaming requests served by this node.
pub struct PublisherHandler<K: CacheKey, V: CacheValue> {
    local: Arc<LocalPublisherManager<K, V>>,
    sessions: DashMap<RequestId, Arc<dyn Session>>,
    generation: AtomicU64,
    metrics: Arc<PublisherMetrics>,
}

impl<K: CacheKey, V: CacheValue> PublisherHandler<K, V> {
    pub fn new(local: Arc<LocalPublisherManager<K, V>>) -> Self {
        let metrics = local.metrics().clone();
        Self {
            local,
            sessions: DashMap::new(),
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Open a session and return its first batch.
    ///
    /// A complete session under the same request id is replaced. An
    /// incomplete one is an invariant violation: it is cancelled and the
    /// registration fails.
    pub async fn register<R: Send + 'static>(
        &self,
        origin: Option<NodeId>,
        command: InitialPublisherCommand<K, V, R>,
    ) -> Result<PublisherResponse<K, R>> {
        self.local.ensure_running()?;
        let InitialPublisherCommand {
            request_id,
            request,
            batch_size,
            track_keys,
            transformation,
        } = command;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(SessionState::<K, R>::new(request_id.clone(), origin, generation));

        // The entry guard locks one shard: the gauge and cancellation run
        // after it is released.
        let (prior, active) = match self.sessions.entry(request_id.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().is_complete() => {
                (Some(occupied.insert(state.clone())), false)
            }
            Entry::Occupied(occupied) => (Some(occupied.remove()), true),
            Entry::Vacant(vacant) => {
                vacant.insert(state.clone());
                (None, false)
            }
        };
        self.update_gauge();

        if let Some(prior) = prior {
            prior.cancel();
            if active {
                return Err(Error::IllegalState(format!(
                    "publisher {request_id} registered while still active"
                )));
            }
            debug!(%request_id, "replaced completed publisher");
        }

        let upstream = self.upstream(request, track_keys, transformation);
        debug!(%request_id, ?origin, batch_size, track_keys, "publisher registered");

        let producer_state = state.clone();
        let cancelled = state.cancellation();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    trace!(request_id = %producer_state.request_id(), "producer cancelled");
                }
                _ = produce(producer_state.clone(), upstream, batch_size, track_keys) => {}
            }
        });

        self.take(state).await
    }

    /// Return the next batch of an open session.
    pub async fn get_next<R: Send + 'static>(
        &self,
        request_id: &RequestId,
    ) -> Result<PublisherResponse<K, R>> {
        let session = self
            .sessions
            .get(request_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::PublisherNotFound(request_id.clone()))?;

        let state = session
            .as_any()
            .downcast::<SessionState<K, R>>()
            .map_err(|_| Error::IllegalState(format!("publisher {request_id} has another value type")))?;
        self.take(state).await
    }

    /// Cancel a session. Returns whether one was open.
    pub fn close_publisher(&self, request_id: &RequestId) -> bool {
        match self.sessions.remove(request_id) {
            Some((_, session)) => {
                session.cancel();
                self.update_gauge();
                debug!(%request_id, "publisher closed");
                true
            }
            None => false,
        }
    }

    /// Drop every session whose origin is no longer a member.
    pub fn on_view_changed(&self, members: &[NodeId]) {
        let mut orphaned = Vec::new();
        self.sessions.retain(|request_id, session| match session.origin() {
            Some(origin) if !members.contains(&origin) => {
                orphaned.push((request_id.clone(), session.clone()));
                false
            }
            _ => true,
        });

        for (request_id, session) in orphaned {
            warn!(%request_id, origin = ?session.origin(), "origin left, cancelling publisher");
            session.cancel();
        }
        self.update_gauge();
    }

    /// Request ids of the open sessions.
    pub fn open_publishers(&self) -> Vec<RequestId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn take<R: Send + 'static>(
        &self,
        state: Arc<SessionState<K, R>>,
    ) -> Result<PublisherResponse<K, R>> {
        let response = state.next_response().await;
        let finished = match &response {
            Ok(response) => response.complete,
            Err(_) => true,
        };
        if finished {
            self.remove(state.request_id(), state.generation());
        }
        response
    }

    fn remove(&self, request_id: &RequestId, generation: u64) {
        if self
            .sessions
            .remove_if(request_id, |_, session| session.generation() == generation)
            .is_some()
        {
            self.update_gauge();
        }
    }

    fn update_gauge(&self) {
        self.metrics.open_sessions.set(self.sessions.len() as i64);
    }

    fn upstream<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        track_keys: bool,
        transformation: Transformation<K, V, R>,
    ) -> EmissionStream<K, R> {
        match transformation {
            Transformation::Keys(transformer) => {
                self.mode_upstream::<Keys, R>(request, track_keys, transformer)
            }
            Transformation::Entries(transformer) => {
                self.mode_upstream::<Entries, R>(request, track_keys, transformer)
            }
        }
    }

    fn mode_upstream<M, R>(
        &self,
        request: PublisherRequest<K>,
        track_keys: bool,
        transformer: Transformer<M::Item, R>,
    ) -> EmissionStream<K, R>
    where
        M: PublisherMode<K, V>,
        R: Send + 'static,
    {
        if !track_keys {
            return self
                .local
                .publisher::<M, R>(request, transformer)
                .with_lost_segments()
                .map(|notification| notification.map(Emission::from))
                .boxed();
        }

        // Read raw items exactly once and expand each one separately, so
        // every source key can be marked done after its last value.
        let request = request.with_guarantee(DeliveryGuarantee::ExactlyOnce);
        self.local
            .publisher::<M, M::Item>(request, Transformer::identity())
            .with_lost_segments()
            .flat_map(move |notification| -> EmissionStream<K, R> {
                match notification {
                    Ok(Notification::Value { value, segment }) => {
                        let key = M::key_of(&value).clone();
                        let expanded = transformer
                            .apply(stream::once(future::ready(value)).boxed())
                            .map(move |result| result.map(|value| Emission::Value { value, segment }));
                        let done = stream::once(future::ready(Ok(Emission::KeyDone { key, segment })));
                        expanded.chain(done).boxed()
                    }
                    Ok(Notification::SegmentComplete(segment)) => {
                        stream::once(future::ready(Ok(Emission::Complete(segment)))).boxed()
                    }
                    Ok(Notification::SegmentLost(segment)) => {
                        stream::once(future::ready(Ok(Emission::Lost(segment)))).boxed()
                    }
                    Err(err) => stream::once(future::ready(Err(err))).boxed(),
                }
            })
            .boxed()
    }
}

/// Drive `upstream` into batches for `state` until it ends or fails.
async fn produce<K: Send + Sync + 'static, R: Send + 'static>(
    state: Arc<SessionState<K, R>>,
    mut upstream: EmissionStream<K, R>,
    batch_size: usize,
    track_keys: bool,
) {
    let mut batch = BatchBuilder::new(batch_size, track_keys);
    loop {
        match upstream.next().await {
            None => {
                trace!(request_id = %state.request_id(), values = batch.len(), "publisher complete");
                state.deliver(batch.build(true));
                return;
            }
            Some(Err(err)) => {
                debug!(request_id = %state.request_id(), error = %err, "publisher failed");
                state.fail(err);
                return;
            }
            Some(Ok(Emission::Value { value, segment })) => {
                if batch.is_full() {
                    let next = batch.next();
                    state.deliver(std::mem::replace(&mut batch, next).build(false));
                    batch.push(value, segment);
                    if state.wait_for_demand().await.is_err() {
                        return;
                    }
                } else {
                    batch.push(value, segment);
                }
            }
            Some(Ok(Emission::KeyDone { key, segment })) => batch.key_done(key, segment),
            Some(Ok(Emission::Complete(segment))) => batch.complete(segment),
            Some(Ok(Emission::Lost(segment))) => batch.lose(segment),
        }
    }
}
