//! An in-process cluster for testing publishers.
//!
//! Every node gets a [`MemoryStore`], a local publisher manager, a
//! publisher handler and a cluster publisher manager. Nodes talk through a
//! [`MemoryNetwork`] and share one [`ClusterTopology`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TestCluster                          │
//! │                                                              │
//! │   ClusterTopology ──► NodeTopology (one per node)            │
//! │                                                              │
//! │   ┌──────── node 1 ────────┐      ┌──────── node 2 ────────┐ │
//! │   │ ClusterPublisherManager│      │ ClusterPublisherManager│ │
//! │   │   MemoryTransport ─────┼──┐   │   MemoryTransport      │ │
//! │   │ CommandDispatcher ◄────┼──┼───┼── MemoryNetwork        │ │
//! │   │ Local manager, handler │  └──►│ CommandDispatcher      │ │
//! │   │ MemoryStore            │      │ MemoryStore            │ │
//! │   └────────────────────────┘      └────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Moving a segment copies its entries to the new owners, installs the
//! next topology and then notifies the previous owners, like a state
//! transfer would. Moves can be triggered from inside a read with
//! [`TestCluster::move_on_read`], or randomly with
//! [`TestCluster::start_churn`].
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = TestCluster::new(PublisherConfig::new(16), 3, 1)?;
//! cluster.populate(numbered_entries(100));
//!
//! let manager = cluster.manager(1).unwrap();
//! assert_eq!(manager.size(None, false).await?, 100);
//! ```

mod churn;
mod network;
mod store;
mod topology;
mod utils;

#[cfg(test)]
mod cluster_reduction_tests;
#[cfg(test)]
mod handler_tests;
#[cfg(test)]
mod partition_tests;

pub use churn::{ChurnConfig, ChurnPlanner, ChurnStats, PlannedMove};
pub use network::{CommandRecord, MemoryNetwork, MemoryTransport, NodeFault};
pub use store::{HookPoint, MemoryStore};
pub use topology::{ClusterTopology, NodeTopology};
pub use utils::{collect_within, numbered_entries, wait_for_result};

use crate::cluster::ClusterPublisherManager;
use crate::command::CommandDispatcher;
use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::handler::PublisherHandler;
use crate::local::LocalPublisherManager;
use crate::metrics::PublisherMetrics;
use crate::partitioning::{HashPartitioner, KeyPartitioner, SegmentRing};
use crate::topology::CacheTopology;
use crate::types::{CacheKey, CacheValue, NodeId, SegmentId, SegmentSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info};

/// Cluster publisher manager of a test node.
pub type NodeManager<K, V> = ClusterPublisherManager<K, V, MemoryTransport<K, V>>;

/// One member of a [`TestCluster`].
pub struct TestNode<K: CacheKey, V: CacheValue> {
    pub id: NodeId,
    pub store: MemoryStore<K, V>,
    pub local: Arc<LocalPublisherManager<K, V>>,
    pub handler: Arc<PublisherHandler<K, V>>,
    pub manager: NodeManager<K, V>,
}

/// A cluster of in-process nodes.
pub struct TestCluster<K: CacheKey, V: CacheValue> {
    state: Arc<ClusterState<K, V>>,

    /// When the test started.
    pub started_at: Instant,
}

struct ClusterState<K: CacheKey, V: CacheValue> {
    config: PublisherConfig,
    topology: ClusterTopology,
    network: Arc<MemoryNetwork<K, V>>,
    partitioner: Arc<dyn KeyPartitioner<K>>,
    nodes: RwLock<BTreeMap<NodeId, Arc<TestNode<K, V>>>>,
}

impl<K, V> TestCluster<K, V>
where
    K: CacheKey + Ord,
    V: CacheValue,
{
    /// Nodes `1..=node_count`, segments placed on a hash ring with
    /// `num_owners` owners each.
    pub fn new(config: PublisherConfig, node_count: usize, num_owners: usize) -> Result<Self> {
        let mut ring = SegmentRing::new(num_owners);
        for node in 1..=node_count as NodeId {
            ring.add_node(node);
        }
        let topology = CacheTopology::from_ring(1, &ring, config.num_segments);
        Self::build(config, topology)
    }

    /// Explicit owners per segment, primary first.
    pub fn with_owners(config: PublisherConfig, members: Vec<NodeId>, owners: Vec<Vec<NodeId>>) -> Result<Self> {
        if owners.len() != config.num_segments as usize {
            return Err(Error::Config(format!(
                "{} owner lists for {} segments",
                owners.len(),
                config.num_segments
            )));
        }
        let topology = CacheTopology::new(1, members, owners);
        Self::build(config, topology)
    }

    fn build(config: PublisherConfig, topology: CacheTopology) -> Result<Self> {
        config.validate()?;
        let partitioner: Arc<dyn KeyPartitioner<K>> = Arc::new(HashPartitioner::new(config.num_segments));
        let members = topology.members().to_vec();
        let state = Arc::new(ClusterState {
            config,
            topology: ClusterTopology::new(topology),
            network: MemoryNetwork::new(),
            partitioner,
            nodes: RwLock::new(BTreeMap::new()),
        });

        for id in members {
            let node = state.start_node(id)?;
            state.nodes.write().insert(id, node);
        }
        info!(nodes = state.nodes.read().len(), "test cluster started");

        Ok(Self {
            state,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.state.config
    }

    pub fn topology(&self) -> Arc<CacheTopology> {
        self.state.topology.current()
    }

    pub fn network(&self) -> &Arc<MemoryNetwork<K, V>> {
        &self.state.network
    }

    pub fn partitioner(&self) -> &Arc<dyn KeyPartitioner<K>> {
        &self.state.partitioner
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.state.nodes.read().keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<TestNode<K, V>>> {
        self.state.nodes.read().get(&id).cloned()
    }

    pub fn manager(&self, id: NodeId) -> Option<NodeManager<K, V>> {
        self.node(id).map(|node| node.manager.clone())
    }

    /// Store every entry on the current owners of its segment.
    pub fn populate(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let topology = self.topology();
        let nodes = self.state.nodes.read().clone();
        for (key, value) in entries {
            let segment = self.state.partitioner.segment_of(&key);
            let owners = topology
                .owners(segment)
                .map(|owners| owners.read_owners.clone())
                .unwrap_or_default();
            for owner in owners {
                if let Some(node) = nodes.get(&owner) {
                    node.store.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Segments read-owned by `node` in the current topology.
    pub fn segments_of(&self, node: NodeId) -> SegmentSet {
        let topology = self.topology();
        (0..topology.num_segments())
            .filter(|&segment| topology.is_read_owner(segment, node))
            .collect()
    }

    /// Hand `segment` over to `owners`.
    pub fn move_segment(&self, segment: SegmentId, owners: Vec<NodeId>) -> Arc<CacheTopology> {
        self.state.move_segment(segment, owners)
    }

    /// Hand `segment` over to `owners` the next time `node` reads it.
    pub fn move_on_read(&self, node: NodeId, segment: SegmentId, point: HookPoint, owners: Vec<NodeId>) -> bool {
        let Some(reader) = self.node(node) else {
            return false;
        };
        let state: Weak<ClusterState<K, V>> = Arc::downgrade(&self.state);
        reader.store.on_read(segment, point, move |segment| {
            if let Some(state) = state.upgrade() {
                state.move_segment(segment, owners);
            }
        });
        true
    }

    /// Stop the caches of `node`. The node stays a member.
    pub fn stop_node(&self, node: NodeId) {
        if let Some(stopped) = self.node(node) {
            stopped.local.stop();
            stopped.manager.stop();
        }
        self.state.network.set_fault(node, NodeFault::Stopped);
    }

    /// Remove `node` from the cluster, handing its segments to the
    /// remaining members.
    pub fn remove_node(&self, node: NodeId) -> Arc<CacheTopology> {
        self.state.remove_node(node)
    }

    /// Apply random segment moves in the background.
    pub fn start_churn(&self, config: ChurnConfig) -> ChurnHandle {
        if let Some((min, max)) = config.message_delay() {
            self.state.network.set_delay(min, max);
        }

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let mut planner = ChurnPlanner::new(&config);
            let mut stats = ChurnStats::default();
            for _ in 0..config.moves {
                tokio::time::sleep(config.interval).await;
                let topology = state.topology.current();
                if let Some(planned) = planner.next_move(&topology) {
                    let before = topology
                        .owners(planned.segment)
                        .map(|owners| owners.read_owners.clone())
                        .unwrap_or_default();
                    stats.segments_lost += before.iter().filter(|n| !planned.owners.contains(n)).count();
                    state.move_segment(planned.segment, planned.owners);
                    stats.moves += 1;
                }
            }
            stats
        });
        ChurnHandle {
            task: AbortOnDropHandle::new(task),
        }
    }

    /// Entries stored on at least one member.
    pub fn distinct_keys(&self) -> BTreeSet<K> {
        let nodes = self.state.nodes.read().clone();
        let num_segments = self.state.config.num_segments;
        let mut keys = BTreeSet::new();
        for node in nodes.values() {
            for segment in 0..num_segments {
                keys.extend(node.store.segment_entries(segment).into_keys());
            }
        }
        keys
    }

    /// Get elapsed time since test started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A running churn task. Dropping it stops the churn.
pub struct ChurnHandle {
    task: AbortOnDropHandle<ChurnStats>,
}

impl ChurnHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for every planned move.
    pub async fn finish(self) -> Result<ChurnStats> {
        Ok(self.task.await?)
    }
}

impl<K, V> ClusterState<K, V>
where
    K: CacheKey + Ord,
    V: CacheValue,
{
    fn start_node(&self, id: NodeId) -> Result<Arc<TestNode<K, V>>> {
        let store = MemoryStore::new(self.partitioner.clone());
        let local = Arc::new(LocalPublisherManager::new(
            self.config.clone(),
            Arc::new(store.clone()),
            Arc::new(self.topology.view(id)),
            self.partitioner.clone(),
            Arc::new(PublisherMetrics::new()),
        ));
        let handler = Arc::new(PublisherHandler::new(local.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(local.clone(), handler.clone()));
        self.network.register(id, dispatcher.clone());
        let manager = ClusterPublisherManager::new(dispatcher, Arc::new(self.network.transport(id)))?;

        Ok(Arc::new(TestNode {
            id,
            store,
            local,
            handler,
            manager,
        }))
    }

    fn move_segment(&self, segment: SegmentId, owners: Vec<NodeId>) -> Arc<CacheTopology> {
        let nodes = self.nodes.read().clone();
        let current = self.topology.current();
        let previous = current
            .owners(segment)
            .map(|owners| owners.read_owners.clone())
            .unwrap_or_default();

        let entries = previous
            .iter()
            .find_map(|owner| nodes.get(owner))
            .map(|owner| owner.store.segment_entries(segment))
            .unwrap_or_default();
        for gainer in owners.iter().filter(|node| !previous.contains(node)) {
            if let Some(node) = nodes.get(gainer) {
                node.store.install_segment(segment, entries.clone());
            }
        }

        let next = self
            .topology
            .update(|current, id| current.with_segment_owners(id, segment, owners.clone()));
        debug!(segment, ?previous, ?owners, topology_id = next.id(), "segment moved");

        let lost: SegmentSet = [segment].into();
        for loser in previous.iter().filter(|node| !owners.contains(node)) {
            if let Some(node) = nodes.get(loser) {
                node.local.segments_lost(&lost);
                node.store.drop_segment(segment);
            }
        }
        next
    }

    fn remove_node(&self, leaving: NodeId) -> Arc<CacheTopology> {
        self.network.set_fault(leaving, NodeFault::Suspected);
        let nodes = self.nodes.read().clone();
        let current = self.topology.current();
        let survivors: Vec<NodeId> = current
            .members()
            .iter()
            .copied()
            .filter(|&node| node != leaving)
            .collect();

        let mut owners = Vec::with_capacity(current.num_segments() as usize);
        for segment in 0..current.num_segments() {
            let mut segment_owners = current
                .owners(segment)
                .map(|owners| owners.read_owners.clone())
                .unwrap_or_default();
            let held = segment_owners.contains(&leaving);
            segment_owners.retain(|&node| node != leaving);
            if held && segment_owners.is_empty() && !survivors.is_empty() {
                let heir = survivors[segment as usize % survivors.len()];
                if let (Some(from), Some(to)) = (nodes.get(&leaving), nodes.get(&heir)) {
                    to.store.install_segment(segment, from.store.segment_entries(segment));
                }
                segment_owners.push(heir);
            }
            owners.push(segment_owners);
        }

        let next = self
            .topology
            .install(CacheTopology::new(current.id() + 1, survivors.clone(), owners));
        info!(node = leaving, topology_id = next.id(), "node left");

        for survivor in &survivors {
            if let Some(node) = nodes.get(survivor) {
                node.handler.on_view_changed(&survivors);
            }
        }
        if let Some(node) = nodes.get(&leaving) {
            node.local.stop();
            node.manager.stop();
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> TestCluster<u64, u64> {
        TestCluster::with_owners(
            PublisherConfig::new(4),
            vec![1, 2, 3],
            vec![vec![1], vec![1], vec![2], vec![2]],
        )
        .unwrap()
    }

    #[test]
    fn test_owner_count_must_match_segments() {
        let result = TestCluster::<u64, u64>::with_owners(PublisherConfig::new(4), vec![1], vec![vec![1]]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_populate_places_entries_on_owners() {
        let cluster = cluster();
        cluster.populate(numbered_entries(64));

        let node1 = cluster.node(1).unwrap();
        let node3 = cluster.node(3).unwrap();
        assert_eq!(cluster.segments_of(1), SegmentSet::from([0, 1]));
        assert!(node3.store.is_empty());
        assert_eq!(
            node1.store.len() + cluster.node(2).unwrap().store.len(),
            64
        );
        assert_eq!(cluster.distinct_keys().len(), 64);
    }

    #[tokio::test]
    async fn test_move_segment_transfers_entries() {
        let cluster = cluster();
        cluster.populate(numbered_entries(64));
        let before = cluster.node(2).unwrap().store.segment_entries(2);

        let next = cluster.move_segment(2, vec![3]);

        assert_eq!(next.id(), 2);
        assert_eq!(next.primary(2), Some(3));
        assert!(cluster.node(2).unwrap().store.segment_entries(2).is_empty());
        assert_eq!(cluster.node(3).unwrap().store.segment_entries(2), before);
        assert_eq!(cluster.node(2).unwrap().local.metrics().segments_lost.get(), 1);
    }

    #[tokio::test]
    async fn test_remove_node_reassigns_segments() {
        let cluster = cluster();
        cluster.populate(numbered_entries(64));

        let next = cluster.remove_node(2);

        assert_eq!(next.members(), &[1, 3]);
        for segment in 0..4 {
            assert!(next.primary(segment).is_some());
            assert_ne!(next.primary(segment), Some(2));
        }
        assert!(!cluster.node(2).unwrap().local.is_running());
        assert_eq!(cluster.distinct_keys().len(), 64);
    }
}
