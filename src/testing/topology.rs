//! An in-process topology authority shared by every test node.

use crate::topology::{CacheTopology, TopologyOracle};
use crate::types::NodeId;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Installs topologies and hands out per-node views of them.
///
/// Every view observes an installed topology immediately.
#[derive(Debug)]
pub struct ClusterTopology {
    sender: watch::Sender<Arc<CacheTopology>>,
}

impl ClusterTopology {
    pub fn new(initial: CacheTopology) -> Self {
        let (sender, _) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    pub fn current(&self) -> Arc<CacheTopology> {
        self.sender.borrow().clone()
    }

    /// Install `topology`, which must be newer than the current one.
    pub fn install(&self, topology: CacheTopology) -> Arc<CacheTopology> {
        let topology = Arc::new(topology);
        debug!(topology_id = topology.id(), "installing topology");
        self.sender.send_replace(topology.clone());
        topology
    }

    /// Derive the next topology from the current one and install it.
    ///
    /// `next` receives the current topology and the id to use.
    pub fn update<F>(&self, next: F) -> Arc<CacheTopology>
    where
        F: FnOnce(&CacheTopology, u64) -> CacheTopology,
    {
        let current = self.current();
        self.install(next(&current, current.id() + 1))
    }

    /// The topology as seen from `node`.
    pub fn view(&self, node: NodeId) -> NodeTopology {
        NodeTopology {
            node,
            receiver: self.sender.subscribe(),
        }
    }
}

/// One node's view of a [`ClusterTopology`].
#[derive(Debug, Clone)]
pub struct NodeTopology {
    node: NodeId,
    receiver: watch::Receiver<Arc<CacheTopology>>,
}

impl TopologyOracle for NodeTopology {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn current(&self) -> Arc<CacheTopology> {
        self.receiver.borrow().clone()
    }

    fn topology_future(&self, id: u64) -> BoxFuture<'static, ()> {
        let mut receiver = self.receiver.clone();
        async move {
            if receiver.wait_for(|topology| topology.id() >= id).await.is_err() {
                // the authority is gone; no newer topology will come
                future::pending::<()>().await;
            }
        }
        .boxed()
    }
}
