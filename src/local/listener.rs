//! Segment-loss listeners for in-flight local scans.
//!
//! Every local manager owns one [`SegmentListenerRegistry`]. A scan that
//! must know about ownership changes registers a [`SegmentTracker`] and
//! holds the returned [`ListenerGuard`] for as long as it runs; dropping
//! the guard deregisters the tracker.

use crate::topology::CacheTopology;
use crate::types::{NodeId, SegmentId, SegmentSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Receives segment-loss notifications. Must not block.
pub trait SegmentLossListener: Send + Sync {
    fn segment_lost(&self, segment: SegmentId);
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<u64, Arc<dyn SegmentLossListener>>,
}

/// Listeners of one cache instance, guarded by a single lock.
#[derive(Clone, Default)]
pub struct SegmentListenerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SegmentListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener until the returned guard is dropped.
    pub fn register(&self, listener: Arc<dyn SegmentLossListener>) -> ListenerGuard {
        let mut registry = self.inner.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, listener);

        ListenerGuard {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Notify every registered listener that `segments` are no longer
    /// read-owned locally. Listeners run on the calling thread.
    pub fn notify_lost(&self, segments: &SegmentSet) {
        let listeners: Vec<_> = self.inner.lock().listeners.values().cloned().collect();
        for listener in listeners {
            for &segment in segments {
                listener.segment_lost(segment);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deregisters its listener on drop.
pub struct ListenerGuard {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().listeners.remove(&self.id);
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    pending: SegmentSet,
    lost: SegmentSet,
}

/// Tracks which segments of one scan were lost while being read.
///
/// A segment counts as lost only while it is pending. Finishing a segment
/// and observing its loss happen under the same lock, so a segment is
/// either finished intact or reported lost, never both.
#[derive(Debug)]
pub struct SegmentTracker {
    state: Mutex<TrackerState>,
}

impl SegmentTracker {
    pub fn new(segments: SegmentSet) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                pending: segments,
                lost: SegmentSet::new(),
            }),
        }
    }

    /// Mark every pending segment `node` does not read-own in `topology`.
    pub fn verify_topology(&self, topology: &CacheTopology, node: NodeId) {
        let mut state = self.state.lock();
        let TrackerState { pending, lost } = &mut *state;
        for &segment in pending.iter() {
            if !topology.is_read_owner(segment, node) {
                trace!(segment, topology_id = topology.id(), "segment not owned before scan");
                lost.insert(segment);
            }
        }
    }

    pub fn is_lost(&self, segment: SegmentId) -> bool {
        self.state.lock().lost.contains(&segment)
    }

    /// Finish reading `segment`. Returns `true` if it was read intact.
    pub fn finish(&self, segment: SegmentId) -> bool {
        let mut state = self.state.lock();
        let was_pending = state.pending.remove(&segment);
        was_pending && !state.lost.contains(&segment)
    }

    pub fn lost(&self) -> SegmentSet {
        self.state.lock().lost.clone()
    }

    pub fn has_losses(&self) -> bool {
        !self.state.lock().lost.is_empty()
    }
}

impl SegmentLossListener for SegmentTracker {
    fn segment_lost(&self, segment: SegmentId) {
        let mut state = self.state.lock();
        if state.pending.contains(&segment) && state.lost.insert(segment) {
            trace!(segment, "tracked segment lost");
        }
    }
}
