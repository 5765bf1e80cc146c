//! An in-process transport between test nodes with fault injection.

use crate::command::{CommandDispatcher, CommandKind, CommandReply, PublisherCommand, PublisherTransport};
use crate::error::{Error, Result};
use crate::types::{CacheKey, CacheValue, NodeId, SegmentSet};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// How a node fails every command sent to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFault {
    /// The node left the cluster.
    Suspected,
    /// The node's cache stopped.
    Stopped,
}

/// One command seen by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub origin: NodeId,
    pub target: NodeId,
    pub kind: CommandKind,
    pub segments: Option<SegmentSet>,
}

/// Routes commands to the dispatchers of registered nodes.
pub struct MemoryNetwork<K: CacheKey, V: CacheValue> {
    dispatchers: DashMap<NodeId, Arc<CommandDispatcher<K, V>>>,
    faults: DashMap<NodeId, NodeFault>,
    /// Commands failing with a remote error, by target and kind.
    failures: DashMap<(NodeId, CommandKind), String>,
    delay: RwLock<Option<(Duration, Duration)>>,
    log: Mutex<Vec<CommandRecord>>,
}

impl<K: CacheKey, V: CacheValue> MemoryNetwork<K, V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatchers: DashMap::new(),
            faults: DashMap::new(),
            failures: DashMap::new(),
            delay: RwLock::new(None),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, node: NodeId, dispatcher: Arc<CommandDispatcher<K, V>>) {
        self.dispatchers.insert(node, dispatcher);
    }

    /// A transport sending from `origin`.
    pub fn transport(self: &Arc<Self>, origin: NodeId) -> MemoryTransport<K, V> {
        MemoryTransport {
            origin,
            network: self.clone(),
        }
    }

    pub fn set_fault(&self, node: NodeId, fault: NodeFault) {
        self.faults.insert(node, fault);
    }

    pub fn clear_fault(&self, node: NodeId) {
        self.faults.remove(&node);
    }

    /// Fail every `kind` command sent to `node` with a remote error.
    pub fn fail_commands(&self, node: NodeId, kind: CommandKind, message: impl Into<String>) {
        self.failures.insert((node, kind), message.into());
    }

    /// Delay every command by a random duration in `[min, max]`.
    pub fn set_delay(&self, min: Duration, max: Duration) {
        *self.delay.write() = Some((min.min(max), max));
    }

    pub fn clear_delay(&self) {
        *self.delay.write() = None;
    }

    pub fn records(&self) -> Vec<CommandRecord> {
        self.log.lock().clone()
    }

    /// Commands of `kind` sent to `target`.
    pub fn records_to(&self, target: NodeId, kind: CommandKind) -> Vec<CommandRecord> {
        self.log
            .lock()
            .iter()
            .filter(|record| record.target == target && record.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.log.lock().iter().filter(|record| record.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn sample_delay(&self) -> Option<Duration> {
        let (min, max) = (*self.delay.read())?;
        let min_us = min.as_micros() as u64;
        let max_us = max.as_micros() as u64;
        Some(Duration::from_micros(rand::thread_rng().gen_range(min_us..=max_us)))
    }

    async fn deliver<R: Send + 'static>(
        &self,
        origin: NodeId,
        target: NodeId,
        command: PublisherCommand<K, V, R>,
    ) -> Result<CommandReply<K, R>> {
        let kind = command.kind();
        self.log.lock().push(CommandRecord {
            origin,
            target,
            kind,
            segments: command.segments().cloned(),
        });
        trace!(origin, target, %kind, "delivering command");

        let fault = self.faults.get(&target).map(|fault| *fault);
        match fault {
            Some(NodeFault::Suspected) => return Err(Error::NodeSuspected { node: target }),
            Some(NodeFault::Stopped) => return Err(Error::CacheNotRunning { node: target }),
            None => {}
        }
        let failure = self.failures.get(&(target, kind)).map(|message| message.clone());
        if let Some(message) = failure {
            return Err(Error::Remote(message));
        }

        if let Some(delay) = self.sample_delay() {
            tokio::time::sleep(delay).await;
        }

        let dispatcher = self
            .dispatchers
            .get(&target)
            .map(|dispatcher| dispatcher.clone())
            .ok_or(Error::NodeSuspected { node: target })?;
        match dispatcher.dispatch(Some(origin), command).await {
            Err(Error::LifecycleStopped) => Err(Error::CacheNotRunning { node: target }),
            reply => reply,
        }
    }
}

/// [`PublisherTransport`] of one node on a [`MemoryNetwork`].
pub struct MemoryTransport<K: CacheKey, V: CacheValue> {
    origin: NodeId,
    network: Arc<MemoryNetwork<K, V>>,
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> PublisherTransport<K, V> for MemoryTransport<K, V> {
    async fn invoke<R: Send + 'static>(
        &self,
        target: NodeId,
        command: PublisherCommand<K, V, R>,
    ) -> Result<CommandReply<K, R>> {
        self.network.deliver(self.origin, target, command).await
    }
}
