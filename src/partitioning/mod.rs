//! Partitioning of the key space into segments and of segments onto nodes.
//!
//! ```text
//! key ──XxHash64──▶ segment ──SegmentRing──▶ [primary, backup, ...]
//! ```
//!
//! A [`KeyPartitioner`] maps every key to one of `num_segments` segments.
//! A [`SegmentRing`] places segments on nodes with consistent hashing so
//! that membership changes move as few segments as possible.
//!
//! # Example
//!
//! ```rust,ignore
//! use segment_publisher::partitioning::{HashPartitioner, KeyPartitioner, SegmentRing};
//!
//! let partitioner = HashPartitioner::new(256);
//! let segment = partitioner.segment_of(&"user:123");
//!
//! let mut ring = SegmentRing::new(2);
//! ring.add_node(1);
//! ring.add_node(2);
//! let owners = ring.owners_of(segment);
//! ```

mod hashring;
mod partitioner;

pub use hashring::{SegmentMove, SegmentRing, DEFAULT_VNODES_PER_NODE};
pub use partitioner::{HashPartitioner, KeyPartitioner};
