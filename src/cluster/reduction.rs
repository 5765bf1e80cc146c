//! Whole-result reductions with retry of suspected shares.

use super::targets::{delivery_to_use, Share};
use super::Inner;
use crate::command::{Collation, PublisherCommand, PublisherTransport, ReductionCommand};
use crate::error::Result;
use crate::functions::Finalizer;
use crate::request::PublisherRequest;
use crate::result::{PublisherResult, Suspicion};
use crate::types::{CacheKey, CacheValue, NodeId};
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

type Outcome<K, R> = (NodeId, Share<K>, Result<PublisherResult<K, R>>);

impl<K, V, T> Inner<K, V, T>
where
    K: CacheKey,
    V: CacheValue,
    T: PublisherTransport<K, V>,
{
    pub(super) async fn reduction<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collation: Collation<K, V, R>,
        finalizer: Finalizer<R>,
    ) -> Result<R> {
        self.ensure_running()?;
        self.metrics.reductions_started.inc();
        let _timer = self.metrics.reduction_latency.start_timer();

        // Partial values reach the finalizer as soon as each target replies.
        let (partials, received) = mpsc::unbounded_channel();
        let finalize = finalizer.collate(UnboundedReceiverStream::new(received).boxed());
        let fan_out = self.fan_out(request, collation, finalizer.clone(), partials);

        match tokio::try_join!(finalize, fan_out) {
            Ok((value, ())) => Ok(value),
            Err(err) => {
                self.metrics.reductions_failed.inc();
                debug!(error = %err, "cluster reduction failed");
                Err(err)
            }
        }
    }

    /// Run attempts until no share is suspected, sending every partial
    /// value to `partials`.
    async fn fan_out<R: Send + 'static>(
        &self,
        request: PublisherRequest<K>,
        collation: Collation<K, V, R>,
        finalizer: Finalizer<R>,
        partials: mpsc::UnboundedSender<R>,
    ) -> Result<()> {
        let mut attempt = request;
        let mut first = true;

        loop {
            let topology = self.topology.current();
            let targets = self.resolver(&topology).resolve(&attempt);
            trace!(
                topology_id = topology.id(),
                targets = targets.by_node.len(),
                "reduction attempt"
            );

            if first && targets.is_empty() {
                // Nothing to read anywhere; still surface the identity.
                let empty = match &collation {
                    Collation::Keys(collator) => collator.collate(stream::empty().boxed()).await?,
                    Collation::Entries(collator) => collator.collate(stream::empty().boxed()).await?,
                };
                let _ = partials.send(empty);
                return Ok(());
            }
            first = false;

            let mut suspicion = Suspicion::None;
            if let Some(unowned) = targets.unowned {
                debug!(topology_id = topology.id(), "requested data without owners");
                suspicion.merge(unowned.into_suspicion())?;
            }

            let local = self.local_node();
            let mut calls: FuturesUnordered<BoxFuture<'_, Outcome<K, R>>> = FuturesUnordered::new();
            let mut local_share = None;
            for (node, share) in targets.by_node {
                if node == local {
                    local_share = Some(share);
                    continue;
                }
                let request = share.clone().apply(&attempt);
                let command = PublisherCommand::Reduction(ReductionCommand {
                    request,
                    collation: collation.clone(),
                    finalizer: finalizer.clone(),
                    topology_id: topology.id(),
                });
                calls.push(
                    async move {
                        let result = self
                            .invoke(node, command, self.config.remote_timeout)
                            .await
                            .and_then(|reply| reply.into_reduction());
                        (node, share, result)
                    }
                    .boxed(),
                );
            }
            if let Some(share) = local_share {
                let mut request = share.clone().apply(&attempt);
                request.guarantee = delivery_to_use(&self.config, &request, local, local);
                let collation = collation.clone();
                let finalizer = finalizer.clone();
                calls.push(
                    async move {
                        let result = match collation {
                            Collation::Keys(collator) => {
                                self.local.key_reduction(request, collator, finalizer).await
                            }
                            Collation::Entries(collator) => {
                                self.local.entry_reduction(request, collator, finalizer).await
                            }
                        };
                        (local, share, result)
                    }
                    .boxed(),
                );
            }

            while let Some((node, share, result)) = calls.next().await {
                match result {
                    Ok(PublisherResult {
                        value,
                        suspicion: suspected,
                    }) => {
                        if let Some(value) = value {
                            let _ = partials.send(value);
                        }
                        self.count_suspicion(&suspected);
                        suspicion.merge(suspected)?;
                    }
                    Err(err) if err.is_target_unavailable() => {
                        warn!(node, error = %err, "target unavailable, retrying its share");
                        let suspected = share.into_suspicion();
                        self.count_suspicion(&suspected);
                        suspicion.merge(suspected)?;
                    }
                    Err(err) => return Err(err),
                }
            }

            attempt = match suspicion {
                Suspicion::None => return Ok(()),
                Suspicion::Segments(segments) => {
                    debug!(?segments, "retrying suspected segments");
                    attempt.with_segments(segments)
                }
                Suspicion::Keys(keys) => {
                    debug!(keys = keys.len(), "retrying suspected keys");
                    attempt.with_keys(keys)
                }
            };
            self.metrics.retries.inc();
            self.topology.topology_future(topology.id() + 1).await;
            self.ensure_running()?;
        }
    }

    fn count_suspicion(&self, suspicion: &Suspicion<K>) {
        match suspicion {
            Suspicion::None => {}
            Suspicion::Segments(segments) => {
                self.metrics.suspected_segments.inc_by(segments.len() as u64)
            }
            Suspicion::Keys(keys) => self.metrics.suspected_keys.inc_by(keys.len() as u64),
        }
    }
}
