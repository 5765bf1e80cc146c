//! Consistent hashing of segments onto nodes with virtual nodes.
//!
//! Each physical node is represented by multiple virtual nodes (vnodes) on
//! the ring. A segment is owned by the first distinct nodes found walking
//! clockwise from the segment's hash.

use crate::types::{NodeId, SegmentId};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per physical node.
pub const DEFAULT_VNODES_PER_NODE: usize = 64;

/// Seed separating segment placement from key partitioning.
const RING_SEED: u64 = 0x5e6_3e17;

/// A consistent hash ring placing segments on nodes.
#[derive(Debug, Clone)]
pub struct SegmentRing {
    /// Ring position to owning node.
    vnodes: BTreeMap<u64, NodeId>,

    vnodes_per_node: usize,

    /// Owners per segment, primary included.
    num_owners: usize,

    /// Sorted physical nodes.
    nodes: Vec<NodeId>,
}

impl SegmentRing {
    pub fn new(num_owners: usize) -> Self {
        Self::with_vnodes(num_owners, DEFAULT_VNODES_PER_NODE)
    }

    pub fn with_vnodes(num_owners: usize, vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            num_owners: num_owners.max(1),
            nodes: Vec::new(),
        }
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains_node(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    pub fn add_node(&mut self, node_id: NodeId) {
        if self.nodes.contains(&node_id) {
            return;
        }

        self.nodes.push(node_id);
        self.nodes.sort_unstable();

        for vnode in 0..self.vnodes_per_node {
            self.vnodes.insert(Self::vnode_position(node_id, vnode), node_id);
        }
    }

    pub fn remove_node(&mut self, node_id: NodeId) {
        if !self.nodes.contains(&node_id) {
            return;
        }

        self.nodes.retain(|&n| n != node_id);
        for vnode in 0..self.vnodes_per_node {
            self.vnodes.remove(&Self::vnode_position(node_id, vnode));
        }
    }

    /// Owners of a segment, primary first. Empty if the ring is empty.
    pub fn owners_of(&self, segment: SegmentId) -> Vec<NodeId> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let wanted = self.num_owners.min(self.nodes.len());
        let position = Self::segment_position(segment);
        let mut owners = Vec::with_capacity(wanted);

        for (_, &node_id) in self.vnodes.range(position..).chain(self.vnodes.iter()) {
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() == wanted {
                    break;
                }
            }
        }

        owners
    }

    /// Owners of every segment in `[0, num_segments)`.
    pub fn assign(&self, num_segments: u32) -> Vec<Vec<NodeId>> {
        (0..num_segments).map(|segment| self.owners_of(segment)).collect()
    }

    /// Segments whose owner list differs between `self` and `next`.
    pub fn moved_segments(&self, next: &SegmentRing, num_segments: u32) -> Vec<SegmentMove> {
        (0..num_segments)
            .filter_map(|segment| {
                let before = self.owners_of(segment);
                let after = next.owners_of(segment);
                if before == after {
                    None
                } else {
                    Some(SegmentMove {
                        segment,
                        from: before,
                        to: after,
                    })
                }
            })
            .collect()
    }

    fn vnode_position(node_id: NodeId, vnode: usize) -> u64 {
        let mut hasher = XxHash64::with_seed(RING_SEED);
        node_id.hash(&mut hasher);
        vnode.hash(&mut hasher);
        hasher.finish()
    }

    fn segment_position(segment: SegmentId) -> u64 {
        let mut hasher = XxHash64::with_seed(RING_SEED);
        segment.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for SegmentRing {
    fn default() -> Self {
        Self::new(2)
    }
}

/// A change of owners for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMove {
    pub segment: SegmentId,
    pub from: Vec<NodeId>,
    pub to: Vec<NodeId>,
}

impl SegmentMove {
    /// Nodes that held the segment before and no longer do.
    pub fn losers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.from.iter().copied().filter(|n| !self.to.contains(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_ring() {
        let ring = SegmentRing::new(2);
        assert!(ring.owners_of(0).is_empty());
        assert!(ring.assign(4).iter().all(|owners| owners.is_empty()));
    }

    #[test]
    fn test_single_node_owns_everything() {
        let mut ring = SegmentRing::new(2);
        ring.add_node(1);

        for owners in ring.assign(16) {
            assert_eq!(owners, vec![1]);
        }
    }

    #[test]
    fn test_owners_are_distinct() {
        let mut ring = SegmentRing::new(2);
        for node in 1..=3 {
            ring.add_node(node);
        }

        for owners in ring.assign(64) {
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_every_node_gets_primaries() {
        let mut ring = SegmentRing::new(1);
        for node in 1..=3 {
            ring.add_node(node);
        }

        let mut primaries: HashMap<NodeId, usize> = HashMap::new();
        for owners in ring.assign(256) {
            *primaries.entry(owners[0]).or_default() += 1;
        }
        assert_eq!(primaries.len(), 3);
    }

    #[test]
    fn test_remove_node_moves_only_its_segments() {
        let mut ring = SegmentRing::new(1);
        for node in 1..=3 {
            ring.add_node(node);
        }

        let mut next = ring.clone();
        next.remove_node(3);

        let moves = ring.moved_segments(&next, 128);
        assert!(!moves.is_empty());
        for m in &moves {
            assert_eq!(m.from, vec![3]);
            assert_eq!(m.losers().collect::<Vec<_>>(), vec![3]);
        }
    }

    #[test]
    fn test_duplicate_add_and_missing_remove() {
        let mut ring = SegmentRing::new(2);
        ring.add_node(1);
        ring.add_node(1);
        ring.remove_node(999);
        assert_eq!(ring.nodes(), &[1]);
    }
}
