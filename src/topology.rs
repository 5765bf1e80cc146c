//! Versioned segment ownership, as seen from one node.

use crate::partitioning::SegmentRing;
use crate::types::{NodeId, SegmentId};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Owners of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOwners {
    /// Nodes allowed to serve reads, primary first.
    pub read_owners: Vec<NodeId>,
}

impl SegmentOwners {
    pub fn new(read_owners: Vec<NodeId>) -> Self {
        Self { read_owners }
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.read_owners.first().copied()
    }

    pub fn is_read_owner(&self, node: NodeId) -> bool {
        self.read_owners.contains(&node)
    }
}

/// One version of the segment to owner assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopology {
    id: u64,
    members: Vec<NodeId>,
    owners: Vec<SegmentOwners>,
}

impl CacheTopology {
    /// Build a topology from explicit owner lists, primary first.
    pub fn new(id: u64, members: Vec<NodeId>, owners: Vec<Vec<NodeId>>) -> Self {
        Self {
            id,
            members,
            owners: owners.into_iter().map(SegmentOwners::new).collect(),
        }
    }

    /// Build a topology placing `num_segments` segments with `ring`.
    pub fn from_ring(id: u64, ring: &SegmentRing, num_segments: u32) -> Self {
        Self::new(id, ring.nodes().to_vec(), ring.assign(num_segments))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Owners of a segment. `None` for unknown or unowned segments.
    pub fn owners(&self, segment: SegmentId) -> Option<&SegmentOwners> {
        self.owners
            .get(segment as usize)
            .filter(|owners| !owners.read_owners.is_empty())
    }

    pub fn primary(&self, segment: SegmentId) -> Option<NodeId> {
        self.owners(segment).and_then(SegmentOwners::primary)
    }

    pub fn is_read_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.owners(segment)
            .map(|owners| owners.is_read_owner(node))
            .unwrap_or(false)
    }

    /// A copy with a new id and the owners of `segment` replaced.
    pub fn with_segment_owners(&self, id: u64, segment: SegmentId, owners: Vec<NodeId>) -> Self {
        let mut next = self.clone();
        next.id = id;
        if let Some(slot) = next.owners.get_mut(segment as usize) {
            *slot = SegmentOwners::new(owners);
        }
        next
    }

    /// A copy with a new id and membership.
    pub fn with_members(&self, id: u64, members: Vec<NodeId>) -> Self {
        let mut next = self.clone();
        next.id = id;
        next.members = members;
        next
    }
}

/// Supplies the current topology and notifies about newer ones.
pub trait TopologyOracle: Send + Sync + 'static {
    /// The node this oracle answers for.
    fn local_node(&self) -> NodeId;

    /// The currently installed topology.
    fn current(&self) -> Arc<CacheTopology>;

    /// Resolves once a topology with id `>= id` is installed.
    fn topology_future(&self, id: u64) -> BoxFuture<'static, ()>;

    fn is_local_read_owner(&self, segment: SegmentId) -> bool {
        self.current().is_read_owner(segment, self.local_node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_lookup() {
        let topology = CacheTopology::new(3, vec![1, 2], vec![vec![1, 2], vec![2], vec![]]);

        assert_eq!(topology.id(), 3);
        assert_eq!(topology.num_segments(), 3);
        assert_eq!(topology.primary(0), Some(1));
        assert!(topology.is_read_owner(0, 2));
        assert!(!topology.is_read_owner(1, 1));
        assert!(topology.owners(2).is_none());
        assert!(topology.owners(9).is_none());
    }

    #[test]
    fn test_segment_owner_replacement() {
        let topology = CacheTopology::new(1, vec![1, 2], vec![vec![1], vec![2]]);
        let next = topology.with_segment_owners(2, 1, vec![1]);

        assert_eq!(next.id(), 2);
        assert_eq!(next.primary(1), Some(1));
        assert_eq!(topology.primary(1), Some(2));
    }

    #[test]
    fn test_from_ring() {
        let mut ring = SegmentRing::new(1);
        ring.add_node(5);
        let topology = CacheTopology::from_ring(1, &ring, 8);

        assert_eq!(topology.members(), &[5]);
        assert!((0..8).all(|s| topology.primary(s) == Some(5)));
    }
}
