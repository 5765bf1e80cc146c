//! Work-stealing execution of per-segment work.
//!
//! Workers repeatedly claim the next unclaimed segment from a shared
//! iterator. Partial values stream into the finalizer as they complete.

use crate::error::{Error, Result};
use crate::functions::Finalizer;
use crate::types::{SegmentId, SegmentSet};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::btree_set;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::task::AbortOnDropHandle;

/// Work for one segment. `Ok(None)` means the value was discarded.
pub(crate) type SegmentWork<R> =
    Arc<dyn Fn(SegmentId) -> BoxFuture<'static, Result<Option<R>>> + Send + Sync>;

struct SegmentQueue {
    remaining: Mutex<btree_set::IntoIter<SegmentId>>,
}

impl SegmentQueue {
    fn claim(&self) -> Option<SegmentId> {
        self.remaining.lock().next()
    }
}

/// Run `work` over `segments` on up to `workers` workers and reduce the
/// kept values with `finalizer`.
///
/// The calling task runs one worker itself; the others are spawned and
/// aborted if the returned future is dropped.
pub(crate) async fn run_segments<R: Send + 'static>(
    segments: SegmentSet,
    workers: usize,
    work: SegmentWork<R>,
    finalizer: &Finalizer<R>,
) -> Result<R> {
    let workers = workers.clamp(1, segments.len().max(1));
    let queue = Arc::new(SegmentQueue {
        remaining: Mutex::new(segments.into_iter()),
    });
    let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::unbounded_channel();

    let spawned: Vec<_> = (1..workers)
        .map(|_| {
            AbortOnDropHandle::new(tokio::spawn(worker(
                queue.clone(),
                work.clone(),
                tx.clone(),
                failure.clone(),
            )))
        })
        .collect();
    let inline = worker(queue, work, tx, failure.clone());

    let finalize = finalizer.collate(UnboundedReceiverStream::new(rx).boxed());
    let drain = async move {
        inline.await;
        for handle in spawned {
            handle.await?;
        }
        Ok::<(), Error>(())
    };

    let (value, drained) = tokio::join!(finalize, drain);
    if let Some(err) = failure.lock().take() {
        return Err(err);
    }
    drained?;
    value
}

async fn worker<R>(
    queue: Arc<SegmentQueue>,
    work: SegmentWork<R>,
    tx: mpsc::UnboundedSender<R>,
    failure: Arc<Mutex<Option<Error>>>,
) {
    while let Some(segment) = queue.claim() {
        if failure.lock().is_some() {
            break;
        }
        match work(segment).await {
            Ok(Some(value)) => {
                if tx.send(value).is_err() {
                    // finalizer gave up
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                failure.lock().get_or_insert(err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducers;
    use futures::FutureExt;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn segment_ids(work_log: Arc<Mutex<Vec<SegmentId>>>) -> SegmentWork<Vec<SegmentId>> {
        Arc::new(move |segment| {
            let work_log = work_log.clone();
            async move {
                work_log.lock().push(segment);
                tokio::task::yield_now().await;
                Ok(Some(vec![segment]))
            }
            .boxed()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_segment_claimed_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let segments: SegmentSet = (0..64).collect();

        let result = run_segments(segments, 4, segment_ids(log.clone()), &reducers::concat_vecs())
            .await
            .unwrap();

        let unique: HashSet<_> = result.iter().copied().collect();
        assert_eq!(result.len(), 64);
        assert_eq!(unique.len(), 64);
        assert_eq!(log.lock().len(), 64);
    }

    #[tokio::test]
    async fn test_discarded_values_skip_finalizer() {
        let work: SegmentWork<u64> = Arc::new(|segment| {
            async move { Ok(if segment % 2 == 0 { Some(1) } else { None }) }.boxed()
        });

        let total = run_segments((0..10).collect(), 1, work, &reducers::add()).await.unwrap();
        assert_eq!(total, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_stops_workers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let work: SegmentWork<u64> = Arc::new(move |segment| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if segment == 0 {
                    Err(Error::user("bad segment"))
                } else {
                    Ok(Some(1))
                }
            }
            .boxed()
        });

        let err = run_segments((0..4).collect(), 1, work, &reducers::add())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UserCode(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_segments_still_finalize() {
        let work: SegmentWork<u64> = Arc::new(|_| async { Ok(Some(1)) }.boxed());
        let total = run_segments(SegmentSet::new(), 8, work, &reducers::add()).await.unwrap();
        assert_eq!(total, 0);
    }
}
