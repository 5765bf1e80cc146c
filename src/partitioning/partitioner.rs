//! Mapping of keys to segments.

use crate::types::SegmentId;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Maps a key to the segment it belongs to.
pub trait KeyPartitioner<K>: Send + Sync + 'static {
    fn segment_of(&self, key: &K) -> SegmentId;

    fn num_segments(&self) -> u32;
}

/// Partitions keys by their xxHash64 modulo the segment count.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    num_segments: u32,
    seed: u64,
}

impl HashPartitioner {
    pub fn new(num_segments: u32) -> Self {
        Self::with_seed(num_segments, 0)
    }

    pub fn with_seed(num_segments: u32, seed: u64) -> Self {
        Self {
            num_segments: num_segments.max(1),
            seed,
        }
    }
}

impl<K: Hash> KeyPartitioner<K> for HashPartitioner {
    fn segment_of(&self, key: &K) -> SegmentId {
        let mut hasher = XxHash64::with_seed(self.seed);
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.num_segments)) as SegmentId
    }

    fn num_segments(&self) -> u32 {
        self.num_segments
    }
}
