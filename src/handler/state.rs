//! Per-session state of the batched pull protocol.

use crate::error::{Error, Result};
use crate::notification::Notification;
use crate::result::{PublisherResponse, SegmentResult};
use crate::types::{NodeId, RequestId, SegmentId, SegmentSet};
use parking_lot::Mutex;
use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// One element produced for a session.
#[derive(Debug)]
pub(crate) enum Emission<K, R> {
    Value { value: R, segment: SegmentId },
    /// Every value derived from `key` has been emitted.
    KeyDone { key: K, segment: SegmentId },
    Complete(SegmentId),
    Lost(SegmentId),
}

impl<K, R> From<Notification<R>> for Emission<K, R> {
    fn from(notification: Notification<R>) -> Self {
        match notification {
            Notification::Value { value, segment } => Emission::Value { value, segment },
            Notification::SegmentComplete(segment) => Emission::Complete(segment),
            Notification::SegmentLost(segment) => Emission::Lost(segment),
        }
    }
}

/// Type-erased view of a session, as kept in the session table.
pub(crate) trait Session: Send + Sync + 'static {
    fn origin(&self) -> Option<NodeId>;

    /// The final response or an error has been produced.
    fn is_complete(&self) -> bool;

    fn cancel(&self);

    /// Distinguishes sessions registered under the same request id.
    fn generation(&self) -> u64;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

enum Slot<K, R> {
    Empty,
    Ready(PublisherResponse<K, R>),
    Failed(Error),
    Waiting(oneshot::Sender<Result<PublisherResponse<K, R>>>),
}

/// Hand-off point between a session's producer and its consumer.
///
/// The producer delivers a response, the consumer takes it. Whichever side
/// arrives first parks in the slot. A response delivered while another is
/// still unconsumed is merged into it.
pub(crate) struct SessionState<K, R> {
    request_id: RequestId,
    origin: Option<NodeId>,
    generation: u64,
    slot: Mutex<Slot<K, R>>,
    /// One permit per consumed, non-final response.
    demand: Semaphore,
    cancel: CancellationToken,
    complete: AtomicBool,
}

impl<K: Send + 'static, R: Send + 'static> SessionState<K, R> {
    pub(crate) fn new(request_id: RequestId, origin: Option<NodeId>, generation: u64) -> Self {
        Self {
            request_id,
            origin,
            generation,
            slot: Mutex::new(Slot::Empty),
            demand: Semaphore::new(0),
            cancel: CancellationToken::new(),
            complete: AtomicBool::new(false),
        }
    }

    pub(crate) fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publish a response produced by the producer.
    pub(crate) fn deliver(&self, response: PublisherResponse<K, R>) {
        if response.complete {
            self.complete.store(true, Ordering::SeqCst);
        }

        let mut slot = self.slot.lock();
        *slot = match mem::replace(&mut *slot, Slot::Empty) {
            Slot::Waiting(waiter) => match waiter.send(Ok(response)) {
                Ok(()) => Slot::Empty,
                // consumer went away; keep the response for the next pull
                Err(Ok(response)) => Slot::Ready(response),
                Err(Err(err)) => Slot::Failed(err),
            },
            Slot::Empty => Slot::Ready(response),
            Slot::Ready(pending) => {
                trace!(request_id = %self.request_id, "merging response into unconsumed one");
                Slot::Ready(pending.merge(response))
            }
            Slot::Failed(err) => Slot::Failed(err),
        };
    }

    /// Terminate the session with `err`. An unconsumed response is dropped.
    pub(crate) fn fail(&self, err: Error) {
        self.complete.store(true, Ordering::SeqCst);

        let mut slot = self.slot.lock();
        *slot = match mem::replace(&mut *slot, Slot::Empty) {
            Slot::Waiting(waiter) => {
                let _ = waiter.send(Err(err.clone()));
                Slot::Failed(err)
            }
            Slot::Failed(first) => Slot::Failed(first),
            Slot::Empty | Slot::Ready(_) => Slot::Failed(err),
        };
    }

    /// Take the next response, waiting for the producer if necessary.
    pub(crate) async fn next_response(&self) -> Result<PublisherResponse<K, R>> {
        let waiter = {
            let mut slot = self.slot.lock();
            match mem::replace(&mut *slot, Slot::Empty) {
                Slot::Ready(response) => {
                    self.consumed(&response);
                    return Ok(response);
                }
                Slot::Failed(err) => {
                    *slot = Slot::Failed(err.clone());
                    return Err(err);
                }
                Slot::Waiting(waiter) if !waiter.is_closed() => {
                    *slot = Slot::Waiting(waiter);
                    return Err(Error::IllegalState(format!(
                        "concurrent pull for publisher {}",
                        self.request_id
                    )));
                }
                // an abandoned pull left its waiter behind
                Slot::Waiting(_) | Slot::Empty => {
                    let (tx, rx) = oneshot::channel();
                    *slot = Slot::Waiting(tx);
                    rx
                }
            }
        };

        let response = waiter.await.map_err(|_| Error::Cancelled)??;
        self.consumed(&response);
        Ok(response)
    }

    fn consumed(&self, response: &PublisherResponse<K, R>) {
        if !response.complete {
            self.demand.add_permits(1);
        }
    }

    /// Wait until the consumer took the last delivered response.
    pub(crate) async fn wait_for_demand(&self) -> Result<()> {
        let permit = self.demand.acquire().await.map_err(|_| Error::Cancelled)?;
        permit.forget();
        Ok(())
    }
}

impl<K: Send + Sync + 'static, R: Send + 'static> Session for SessionState<K, R> {
    fn origin(&self) -> Option<NodeId> {
        self.origin
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancel.cancel();
        self.fail(Error::Cancelled);
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Accumulates one response.
///
/// Without key tracking a batch is full at `batch_size` values. With key
/// tracking the values of one source key are never split: values past the
/// batch size go to the overflow and the batch fills up once the key is
/// done.
pub(crate) struct BatchBuilder<K, R> {
    batch_size: usize,
    track_keys: bool,
    values: Vec<R>,
    extra_values: Vec<R>,
    /// Segment of every value, overflow included.
    tags: Vec<SegmentId>,
    completed: SegmentSet,
    lost: SegmentSet,
    keys: Vec<(K, SegmentId)>,
    /// Length of the batch when the current key started.
    key_start: usize,
    full: bool,
}

impl<K, R> BatchBuilder<K, R> {
    pub(crate) fn new(batch_size: usize, track_keys: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            track_keys,
            values: Vec::new(),
            extra_values: Vec::new(),
            tags: Vec::new(),
            completed: SegmentSet::new(),
            lost: SegmentSet::new(),
            keys: Vec::new(),
            key_start: 0,
            full: false,
        }
    }

    /// A fresh builder with the same settings.
    pub(crate) fn next(&self) -> Self {
        Self::new(self.batch_size, self.track_keys)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.full
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len() + self.extra_values.len()
    }

    pub(crate) fn push(&mut self, value: R, segment: SegmentId) {
        if self.track_keys && self.values.len() >= self.batch_size {
            self.extra_values.push(value);
        } else {
            self.values.push(value);
        }
        self.tags.push(segment);
        if !self.track_keys && self.values.len() >= self.batch_size {
            self.full = true;
        }
    }

    pub(crate) fn key_done(&mut self, key: K, segment: SegmentId) {
        if self.len() > self.key_start {
            self.keys.push((key, segment));
        }
        self.key_start = self.len();
        if self.values.len() >= self.batch_size {
            self.full = true;
        }
    }

    pub(crate) fn complete(&mut self, segment: SegmentId) {
        self.keys.retain(|(_, key_segment)| *key_segment != segment);
        self.completed.insert(segment);
    }

    pub(crate) fn lose(&mut self, segment: SegmentId) {
        // Tracked keys keep their values: the client excludes them on retry.
        if !self.track_keys {
            while self.tags.last() == Some(&segment) {
                self.tags.pop();
                self.values.pop();
            }
            self.full = self.values.len() >= self.batch_size;
        }
        self.lost.insert(segment);
    }

    pub(crate) fn build(self, complete: bool) -> PublisherResponse<K, R> {
        let mut segment_results: Vec<SegmentResult> = Vec::new();
        for segment in self.tags {
            match segment_results.last_mut() {
                Some(last) if last.segment == segment => last.entry_count += 1,
                _ => segment_results.push(SegmentResult {
                    segment,
                    entry_count: 1,
                }),
            }
        }

        PublisherResponse {
            values: self.values,
            completed_segments: self.completed,
            lost_segments: self.lost,
            complete,
            segment_results,
            extra_values: self.extra_values,
            keys: self.keys.into_iter().map(|(key, _)| key).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_batch_fills_at_batch_size() {
        let mut batch: BatchBuilder<u32, &str> = BatchBuilder::new(2, false);
        batch.push("a", 0);
        assert!(!batch.is_full());
        batch.push("b", 1);
        assert!(batch.is_full());
        batch.complete(0);

        let response = batch.build(false);
        assert_eq!(response.values, vec!["a", "b"]);
        assert_eq!(response.completed_segments, [0].into());
        assert_eq!(
            response.segment_results,
            vec![
                SegmentResult { segment: 0, entry_count: 1 },
                SegmentResult { segment: 1, entry_count: 1 },
            ]
        );
    }

    #[test]
    fn test_lost_segment_values_dropped() {
        let mut batch: BatchBuilder<u32, &str> = BatchBuilder::new(4, false);
        batch.push("a", 0);
        batch.complete(0);
        batch.push("b", 1);
        batch.push("c", 1);
        batch.lose(1);

        let response = batch.build(true);
        assert_eq!(response.values, vec!["a"]);
        assert_eq!(response.lost_segments, [1].into());
        assert_eq!(response.into_tagged_values().unwrap(), vec![("a", 0)]);
    }

    #[test]
    fn test_key_values_never_split() {
        let mut batch: BatchBuilder<u32, &str> = BatchBuilder::new(2, true);
        batch.push("a1", 0);
        batch.key_done(1, 0);
        assert!(!batch.is_full());

        batch.push("b1", 0);
        batch.push("b2", 0);
        batch.push("b3", 0);
        assert!(!batch.is_full());
        batch.key_done(2, 0);
        assert!(batch.is_full());

        let response = batch.build(false);
        assert_eq!(response.values, vec!["a1", "b1"]);
        assert_eq!(response.extra_values, vec!["b2", "b3"]);
        assert_eq!(response.keys, vec![1, 2]);
        assert_eq!(response.len(), 4);
    }

    #[test]
    fn test_completed_segment_forgets_keys() {
        let mut batch: BatchBuilder<u32, &str> = BatchBuilder::new(8, true);
        batch.push("a", 0);
        batch.key_done(1, 0);
        batch.key_done(2, 0);
        batch.complete(0);
        batch.push("c", 1);
        batch.key_done(3, 1);
        batch.lose(1);

        let response = batch.build(true);
        assert_eq!(response.keys, vec![3]);
        assert_eq!(response.values, vec!["a", "c"]);
        assert_eq!(response.lost_segments, [1].into());
    }

    #[tokio::test]
    async fn test_waiting_consumer_receives_delivery() {
        let state = Arc::new(SessionState::<u32, u32>::new(RequestId::new(1, 1), Some(1), 1));

        let consumer = {
            let state = state.clone();
            tokio::spawn(async move { state.next_response().await })
        };
        tokio::task::yield_now().await;

        let mut batch = BatchBuilder::new(2, false);
        batch.push(7, 0);
        state.deliver(batch.build(false));

        let response = consumer.await.unwrap().unwrap();
        assert_eq!(response.values, vec![7]);
        state.wait_for_demand().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_retried_after_timeout() {
        let state = Arc::new(SessionState::<u32, u32>::new(RequestId::new(1, 9), Some(1), 1));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), state.next_response()).await;
        assert!(abandoned.is_err());

        let retried = {
            let state = state.clone();
            tokio::spawn(async move { state.next_response().await })
        };
        tokio::task::yield_now().await;

        let mut batch = BatchBuilder::new(2, false);
        batch.push(5, 0);
        state.deliver(batch.build(false));

        let response = retried.await.unwrap().unwrap();
        assert_eq!(response.values, vec![5]);
    }

    #[tokio::test]
    async fn test_concurrent_pull_rejected() {
        let state = Arc::new(SessionState::<u32, u32>::new(RequestId::new(1, 10), Some(1), 1));

        let first = {
            let state = state.clone();
            tokio::spawn(async move { state.next_response().await })
        };
        tokio::task::yield_now().await;

        assert!(matches!(state.next_response().await, Err(Error::IllegalState(_))));

        state.deliver(BatchBuilder::new(1, false).build(true));
        assert!(first.await.unwrap().unwrap().complete);
    }

    #[tokio::test]
    async fn test_unconsumed_responses_merge() {
        let state = SessionState::<u32, u32>::new(RequestId::new(1, 2), None, 1);

        let mut first = BatchBuilder::new(1, false);
        first.push(1, 0);
        state.deliver(first.build(false));

        let mut second = BatchBuilder::new(1, false);
        second.push(2, 0);
        second.complete(0);
        state.deliver(second.build(true));
        assert!(state.is_complete());

        let merged = state.next_response().await.unwrap();
        assert!(merged.complete);
        assert_eq!(merged.values, vec![1, 2]);
        assert_eq!(merged.completed_segments, [0].into());
    }

    #[tokio::test]
    async fn test_failure_replaces_ready_response() {
        let state = SessionState::<u32, u32>::new(RequestId::new(1, 3), None, 1);
        state.deliver(BatchBuilder::new(1, false).build(false));
        state.fail(Error::user("boom"));

        assert!(matches!(state.next_response().await, Err(Error::UserCode(_))));
        assert!(matches!(state.next_response().await, Err(Error::UserCode(_))));
    }
}
