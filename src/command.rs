//! Commands exchanged between cluster publisher managers and the nodes
//! serving them.
//!
//! The set of commands is closed. Each node handles them through
//! [`CommandDispatcher::dispatch`], a single exhaustive match.

use crate::error::{Error, Result};
use crate::functions::{Collator, Finalizer, Transformer};
use crate::handler::PublisherHandler;
use crate::local::LocalPublisherManager;
use crate::request::PublisherRequest;
use crate::result::{PublisherResponse, PublisherResult};
use crate::types::{CacheEntry, CacheKey, CacheValue, NodeId, RequestId, SegmentSet};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A collator over keys or over entries.
pub enum Collation<K, V, R> {
    Keys(Collator<K, R>),
    Entries(Collator<CacheEntry<K, V>, R>),
}

impl<K, V, R> Clone for Collation<K, V, R> {
    fn clone(&self) -> Self {
        match self {
            Collation::Keys(collator) => Collation::Keys(collator.clone()),
            Collation::Entries(collator) => Collation::Entries(collator.clone()),
        }
    }
}

/// A transformer over keys or over entries.
pub enum Transformation<K, V, R> {
    Keys(Transformer<K, R>),
    Entries(Transformer<CacheEntry<K, V>, R>),
}

impl<K, V, R> Clone for Transformation<K, V, R> {
    fn clone(&self) -> Self {
        match self {
            Transformation::Keys(transformer) => Transformation::Keys(transformer.clone()),
            Transformation::Entries(transformer) => Transformation::Entries(transformer.clone()),
        }
    }
}

/// Reduce the selected data of one node to a single value.
pub struct ReductionCommand<K: CacheKey, V, R> {
    pub request: PublisherRequest<K>,
    pub collation: Collation<K, V, R>,
    pub finalizer: Finalizer<R>,
    /// Topology the sender resolved targets with. The receiver waits until
    /// it has installed at least this topology.
    pub topology_id: u64,
}

/// Open a streaming session and return its first batch.
pub struct InitialPublisherCommand<K: CacheKey, V, R> {
    pub request_id: RequestId,
    pub request: PublisherRequest<K>,
    pub batch_size: usize,
    /// Report the source keys whose values were all delivered.
    pub track_keys: bool,
    pub transformation: Transformation<K, V, R>,
}

/// Fetch the next batch of an open session.
#[derive(Debug, Clone)]
pub struct NextPublisherCommand {
    pub request_id: RequestId,
    pub batch_size: usize,
}

/// Close an open session.
#[derive(Debug, Clone)]
pub struct CancelPublisherCommand {
    pub request_id: RequestId,
}

/// All commands understood by the publisher core.
pub enum PublisherCommand<K: CacheKey, V, R> {
    Reduction(ReductionCommand<K, V, R>),
    Initial(InitialPublisherCommand<K, V, R>),
    Next(NextPublisherCommand),
    Cancel(CancelPublisherCommand),
}

/// Command discriminant, for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Reduction,
    InitialPublisher,
    NextPublisher,
    CancelPublisher,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Reduction => "reduction",
            CommandKind::InitialPublisher => "initial",
            CommandKind::NextPublisher => "next",
            CommandKind::CancelPublisher => "cancel",
        };
        f.write_str(name)
    }
}

impl<K: CacheKey, V, R> PublisherCommand<K, V, R> {
    pub fn kind(&self) -> CommandKind {
        match self {
            PublisherCommand::Reduction(_) => CommandKind::Reduction,
            PublisherCommand::Initial(_) => CommandKind::InitialPublisher,
            PublisherCommand::Next(_) => CommandKind::NextPublisher,
            PublisherCommand::Cancel(_) => CommandKind::CancelPublisher,
        }
    }

    /// Segments explicitly requested by the command, if any.
    pub fn segments(&self) -> Option<&SegmentSet> {
        match self {
            PublisherCommand::Reduction(command) => command.request.segments.as_ref(),
            PublisherCommand::Initial(command) => command.request.segments.as_ref(),
            PublisherCommand::Next(_) | PublisherCommand::Cancel(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            PublisherCommand::Reduction(_) => None,
            PublisherCommand::Initial(command) => Some(&command.request_id),
            PublisherCommand::Next(command) => Some(&command.request_id),
            PublisherCommand::Cancel(command) => Some(&command.request_id),
        }
    }
}

/// Reply to a [`PublisherCommand`].
#[derive(Debug)]
pub enum CommandReply<K, R> {
    Reduction(PublisherResult<K, R>),
    Batch(PublisherResponse<K, R>),
    Ack,
}

impl<K, R> CommandReply<K, R> {
    pub fn into_reduction(self) -> Result<PublisherResult<K, R>> {
        match self {
            CommandReply::Reduction(result) => Ok(result),
            other => Err(Error::IllegalState(format!(
                "expected a reduction reply, got {}",
                other.name()
            ))),
        }
    }

    pub fn into_batch(self) -> Result<PublisherResponse<K, R>> {
        match self {
            CommandReply::Batch(response) => Ok(response),
            other => Err(Error::IllegalState(format!(
                "expected a batch reply, got {}",
                other.name()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CommandReply::Reduction(_) => "reduction",
            CommandReply::Batch(_) => "batch",
            CommandReply::Ack => "ack",
        }
    }
}

/// Delivers commands to cluster members.
///
/// Implementations own serialization and retries of the underlying RPC. A
/// target that left or stopped its cache fails with
/// [`Error::NodeSuspected`] or [`Error::CacheNotRunning`].
#[async_trait]
pub trait PublisherTransport<K: CacheKey, V: CacheValue>: Send + Sync + 'static {
    async fn invoke<R: Send + 'static>(
        &self,
        target: NodeId,
        command: PublisherCommand<K, V, R>,
    ) -> Result<CommandReply<K, R>>;
}

/// Serves publisher commands on one node.
pub struct CommandDispatcher<K: CacheKey, V: CacheValue> {
    local: Arc<LocalPublisherManager<K, V>>,
    handler: Arc<PublisherHandler<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CommandDispatcher<K, V> {
    pub fn new(local: Arc<LocalPublisherManager<K, V>>, handler: Arc<PublisherHandler<K, V>>) -> Self {
        Self { local, handler }
    }

    pub fn local(&self) -> &Arc<LocalPublisherManager<K, V>> {
        &self.local
    }

    pub fn handler(&self) -> &Arc<PublisherHandler<K, V>> {
        &self.handler
    }

    /// Execute `command` sent by `origin`. `None` marks a command issued by
    /// this node to itself.
    pub async fn dispatch<R: Send + 'static>(
        &self,
        origin: Option<NodeId>,
        command: PublisherCommand<K, V, R>,
    ) -> Result<CommandReply<K, R>> {
        trace!(?origin, kind = %command.kind(), "dispatching publisher command");

        match command {
            PublisherCommand::Reduction(command) => {
                let ReductionCommand {
                    request,
                    collation,
                    finalizer,
                    topology_id,
                } = command;
                self.local.ensure_running()?;
                self.local.topology().topology_future(topology_id).await;

                let result = match collation {
                    Collation::Keys(collator) => {
                        self.local.key_reduction(request, collator, finalizer).await?
                    }
                    Collation::Entries(collator) => {
                        self.local.entry_reduction(request, collator, finalizer).await?
                    }
                };
                Ok(CommandReply::Reduction(result))
            }
            PublisherCommand::Initial(command) => {
                let response = self.handler.register(origin, command).await?;
                Ok(CommandReply::Batch(response))
            }
            PublisherCommand::Next(command) => {
                let response = self.handler.get_next::<R>(&command.request_id).await?;
                Ok(CommandReply::Batch(response))
            }
            PublisherCommand::Cancel(command) => {
                if !self.handler.close_publisher(&command.request_id) {
                    debug!(request_id = %command.request_id, "cancel for unknown publisher");
                }
                Ok(CommandReply::Ack)
            }
        }
    }
}
