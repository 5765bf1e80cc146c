//! Results exchanged between nodes: whole-result reductions and
//! streaming batches.

use crate::error::{Error, Result};
use crate::types::{CacheKey, SegmentId, SegmentSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;

/// Segments or keys that could not be read authoritatively and must be
/// retried. The two kinds are never mixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + std::hash::Hash",
    deserialize = "K: Deserialize<'de> + Eq + std::hash::Hash"
))]
pub enum Suspicion<K> {
    None,
    Segments(SegmentSet),
    Keys(HashSet<K>),
}

impl<K: Eq + Hash> PartialEq for Suspicion<K> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Suspicion::None, Suspicion::None) => true,
            (Suspicion::Segments(mine), Suspicion::Segments(theirs)) => mine == theirs,
            (Suspicion::Keys(mine), Suspicion::Keys(theirs)) => mine == theirs,
            _ => false,
        }
    }
}

impl<K: Eq + Hash> Eq for Suspicion<K> {}

impl<K: CacheKey> Suspicion<K> {
    pub fn is_empty(&self) -> bool {
        match self {
            Suspicion::None => true,
            Suspicion::Segments(segments) => segments.is_empty(),
            Suspicion::Keys(keys) => keys.is_empty(),
        }
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: Suspicion<K>) -> Result<()> {
        match (&mut *self, other) {
            (_, Suspicion::None) => {}
            (Suspicion::None, other) => *self = other,
            (Suspicion::Segments(mine), Suspicion::Segments(theirs)) => mine.extend(theirs),
            (Suspicion::Keys(mine), Suspicion::Keys(theirs)) => mine.extend(theirs),
            _ => {
                return Err(Error::IllegalState(
                    "cannot mix suspected segments and suspected keys".into(),
                ))
            }
        }
        Ok(())
    }
}

/// Outcome of a whole-result reduction on one node.
///
/// `value` is absent when nothing authoritative could be computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + std::hash::Hash, R: Serialize",
    deserialize = "K: Deserialize<'de> + Eq + std::hash::Hash, R: Deserialize<'de>"
))]
pub struct PublisherResult<K, R> {
    pub value: Option<R>,
    pub suspicion: Suspicion<K>,
}

impl<K: Eq + Hash, R: PartialEq> PartialEq for PublisherResult<K, R> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.suspicion == other.suspicion
    }
}

impl<K: Eq + Hash, R: Eq> Eq for PublisherResult<K, R> {}

impl<K: CacheKey, R> PublisherResult<K, R> {
    pub fn value(value: R) -> Self {
        Self {
            value: Some(value),
            suspicion: Suspicion::None,
        }
    }

    /// A value together with segments that must be read again. An empty
    /// set means no suspicion.
    pub fn with_suspected_segments(value: Option<R>, segments: SegmentSet) -> Self {
        let suspicion = if segments.is_empty() {
            Suspicion::None
        } else {
            Suspicion::Segments(segments)
        };
        Self { value, suspicion }
    }

    pub fn suspected_segments(&self) -> Option<&SegmentSet> {
        match &self.suspicion {
            Suspicion::Segments(segments) => Some(segments),
            _ => None,
        }
    }
}

/// Number of consecutive values in a batch that belong to one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment: SegmentId,
    pub entry_count: usize,
}

/// One batch of the streaming protocol.
///
/// `segment_results` tags `values` followed by `extra_values`, in order.
/// `completed_segments` and `lost_segments` are disjoint, and no later
/// batch of the same request carries values of a segment listed in either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherResponse<K, R> {
    pub values: Vec<R>,
    pub completed_segments: SegmentSet,
    pub lost_segments: SegmentSet,
    /// No further batches follow.
    pub complete: bool,
    pub segment_results: Vec<SegmentResult>,
    /// Key tracking only: values past the batch size that belong to the
    /// last key of the batch.
    pub extra_values: Vec<R>,
    /// Key tracking only: source keys of the segment still in progress
    /// whose values were all included.
    pub keys: Vec<K>,
}

impl<K, R> PublisherResponse<K, R> {
    /// Number of values in the batch, overflow included.
    pub fn len(&self) -> usize {
        self.values.len() + self.extra_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold a later response into this one. Values keep their order and
    /// segment sets are unioned.
    pub fn merge(mut self, later: PublisherResponse<K, R>) -> Self {
        self.values.append(&mut self.extra_values);
        self.values.extend(later.values);
        self.extra_values = later.extra_values;
        self.completed_segments.extend(later.completed_segments);
        self.lost_segments.extend(later.lost_segments);
        self.segment_results.extend(later.segment_results);
        self.keys.extend(later.keys);
        self.complete = later.complete;
        self
    }

    /// Pair every value with the segment it belongs to.
    pub fn into_tagged_values(self) -> Result<Vec<(R, SegmentId)>> {
        let total: usize = self.segment_results.iter().map(|r| r.entry_count).sum();
        if total != self.len() {
            return Err(Error::IllegalState(format!(
                "response tags {} values but carries {}",
                total,
                self.len()
            )));
        }

        let mut values = self.values.into_iter().chain(self.extra_values);
        let mut tagged = Vec::with_capacity(total);
        for result in &self.segment_results {
            for value in values.by_ref().take(result.entry_count) {
                tagged.push((value, result.segment));
            }
        }
        Ok(tagged)
    }
}
