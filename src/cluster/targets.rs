//! Resolution of requested segments and keys to the nodes reading them.

use crate::config::{PublisherConfig, StoreMode};
use crate::partitioning::KeyPartitioner;
use crate::request::PublisherRequest;
use crate::result::Suspicion;
use crate::topology::CacheTopology;
use crate::types::{CacheKey, DeliveryGuarantee, NodeId, SegmentId, SegmentSet};
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

/// The part of a request assigned to one node.
#[derive(Debug, Clone)]
pub(crate) enum Share<K> {
    Segments(SegmentSet),
    Keys(HashSet<K>),
}

impl<K: Eq + Hash> PartialEq for Share<K> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Share::Segments(mine), Share::Segments(theirs)) => mine == theirs,
            (Share::Keys(mine), Share::Keys(theirs)) => mine == theirs,
            _ => false,
        }
    }
}

impl<K: Eq + Hash> Eq for Share<K> {}

impl<K: CacheKey> Share<K> {
    /// Suspect the whole share.
    pub(crate) fn into_suspicion(self) -> Suspicion<K> {
        match self {
            Share::Segments(segments) => Suspicion::Segments(segments),
            Share::Keys(keys) => Suspicion::Keys(keys),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Share::Segments(segments) => segments.is_empty(),
            Share::Keys(keys) => keys.is_empty(),
        }
    }

    /// `request` narrowed down to this share.
    pub(crate) fn apply(self, request: &PublisherRequest<K>) -> PublisherRequest<K> {
        match self {
            Share::Segments(segments) => request.clone().with_segments(segments),
            Share::Keys(keys) => request.clone().with_keys(keys),
        }
    }
}

/// Shares of one attempt.
#[derive(Debug)]
pub(crate) struct Targets<K> {
    pub(crate) by_node: BTreeMap<NodeId, Share<K>>,
    /// Requested data without any owner in this topology.
    pub(crate) unowned: Option<Share<K>>,
}

impl<K> Targets<K> {
    pub(crate) fn is_empty(&self) -> bool {
        self.by_node.is_empty() && self.unowned.is_none()
    }
}

/// Whether every segment can be read locally without asking its owners.
pub(crate) fn skip_remote(config: &PublisherConfig, include_loader: bool) -> bool {
    let shared_store = config.store == StoreMode::Shared && include_loader;
    shared_store || (config.replicated && config.store != StoreMode::SharedWriteBehind)
}

/// Guarantee to execute a share on `target` with.
///
/// When everything is read locally there is no ownership to lose, so the
/// cheapest guarantee is enough.
pub(crate) fn delivery_to_use(
    config: &PublisherConfig,
    request: &PublisherRequest<impl CacheKey>,
    target: NodeId,
    local: NodeId,
) -> DeliveryGuarantee {
    if target == local && skip_remote(config, request.include_loader) {
        DeliveryGuarantee::AtMostOnce
    } else {
        request.guarantee
    }
}

/// Resolves shares against one topology.
pub(crate) struct TargetResolver<'a, K> {
    pub(crate) config: &'a PublisherConfig,
    pub(crate) topology: &'a CacheTopology,
    pub(crate) local: NodeId,
    pub(crate) partitioner: &'a dyn KeyPartitioner<K>,
}

impl<'a, K: CacheKey> TargetResolver<'a, K> {
    /// The node to read `segment` from, if any node owns it.
    pub(crate) fn owner_to_read_from(&self, segment: SegmentId, include_loader: bool) -> Option<NodeId> {
        if skip_remote(self.config, include_loader) {
            return Some(self.local);
        }
        let owners = self.topology.owners(segment)?;
        let write_behind = self.config.store == StoreMode::SharedWriteBehind;
        if !write_behind && owners.is_read_owner(self.local) {
            Some(self.local)
        } else {
            owners.primary()
        }
    }

    pub(crate) fn resolve(&self, request: &PublisherRequest<K>) -> Targets<K> {
        match &request.keys {
            Some(keys) => self.resolve_keys(request, keys),
            None => self.resolve_segments(
                request.segments_or_all(self.config.num_segments),
                request.include_loader,
            ),
        }
    }

    pub(crate) fn resolve_segments(&self, segments: SegmentSet, include_loader: bool) -> Targets<K> {
        let mut by_node: BTreeMap<NodeId, SegmentSet> = BTreeMap::new();
        let mut unowned = SegmentSet::new();
        for segment in segments {
            match self.owner_to_read_from(segment, include_loader) {
                Some(node) => {
                    by_node.entry(node).or_default().insert(segment);
                }
                None => {
                    unowned.insert(segment);
                }
            }
        }

        Targets {
            by_node: by_node
                .into_iter()
                .map(|(node, segments)| (node, Share::Segments(segments)))
                .collect(),
            unowned: (!unowned.is_empty()).then_some(Share::Segments(unowned)),
        }
    }

    fn resolve_keys(&self, request: &PublisherRequest<K>, keys: &HashSet<K>) -> Targets<K> {
        let mut by_node: BTreeMap<NodeId, HashSet<K>> = BTreeMap::new();
        let mut unowned = HashSet::new();
        for key in keys {
            let segment = self.partitioner.segment_of(key);
            if let Some(segments) = &request.segments {
                if !segments.contains(&segment) {
                    continue;
                }
            }
            match self.owner_to_read_from(segment, request.include_loader) {
                Some(node) => {
                    by_node.entry(node).or_default().insert(key.clone());
                }
                None => {
                    unowned.insert(key.clone());
                }
            }
        }

        Targets {
            by_node: by_node
                .into_iter()
                .map(|(node, keys)| (node, Share::Keys(keys)))
                .collect(),
            unowned: (!unowned.is_empty()).then_some(Share::Keys(unowned)),
        }
    }
}
