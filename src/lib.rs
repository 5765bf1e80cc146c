//! Segment-aware distributed reductions and streaming over a partitioned
//! cache.
//!
//! The key space is split into segments, each read-owned by one or more
//! nodes. This crate runs two kinds of operations over the whole cluster:
//! - **Reductions**: every owner collates its share to a partial value and
//!   the originator finalizes the partials into one result
//! - **Publishers**: values stream back in batches pulled from every
//!   owner, each segment completed exactly once
//!
//! Segments can change owners while an operation runs. Owners report the
//! segments they lost, and the originator reads them again from their new
//! owners according to the requested [`DeliveryGuarantee`].
//!
//! # Example
//!
//! ```rust,ignore
//! use segment_publisher::reducers::{add, count};
//! use segment_publisher::{DeliveryGuarantee, PublisherRequest};
//!
//! // Count the entries of segments 3 and 7, exactly once.
//! let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce)
//!     .with_segments([3, 7].into());
//! let total = manager.key_reduction(request, count(), add()).await?;
//!
//! // Stream every key, 128 per round trip.
//! let keys = manager
//!     .key_publisher(PublisherRequest::new(DeliveryGuarantee::AtLeastOnce), 128, Transformer::identity())
//!     .values();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   PartitionAwareClusterPublisherManager (optional)       │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              ClusterPublisherManager                     │
//! │  • key_reduction / entry_reduction / size                │
//! │  • key_publisher / entry_publisher                       │
//! └──────────────────────────────────────────────────────────┘
//!          │ local share                     │ PublisherTransport
//!          ▼                                 ▼
//! ┌──────────────────┐             ┌──────────────────────────┐
//! │ LocalPublisher   │◄────────────│ CommandDispatcher        │
//! │ Manager          │             │  └─ PublisherHandler     │
//! └──────────────────┘             └──────────────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ SegmentSource    │
//! └──────────────────┘
//! ```
//!
//! # Delivery guarantees
//!
//! - **AtMostOnce**: no ownership tracking; values of moved segments may
//!   be missing
//! - **AtLeastOnce**: moved segments are read again; values may repeat
//! - **ExactlyOnce**: moved segments are read again and values already
//!   delivered are discarded or skipped

pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod functions;
pub mod handler;
pub mod local;
pub mod metrics;
pub mod notification;
pub mod partitioning;
pub mod reducers;
pub mod request;
pub mod result;
pub mod source;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use config::{PublisherConfig, StoreMode};
pub use error::{Error, Result};
pub use functions::{Collator, Finalizer, Transformer};
pub use notification::Notification;
pub use request::PublisherRequest;
pub use result::{PublisherResponse, PublisherResult, SegmentResult, Suspicion};
pub use types::{
    CacheEntry, CacheKey, CacheValue, DeliveryGuarantee, NodeId, RequestId, SegmentId, SegmentSet,
};

// Re-export publisher managers
pub use cluster::{
    AvailabilityMode, ClusterPublisher, ClusterPublisherManager, InnerPublisherSubscription,
    PartitionAwareClusterPublisherManager,
};
pub use handler::PublisherHandler;
pub use local::{LocalPublisherManager, SegmentAwarePublisher};

// Re-export wiring types
pub use command::{CommandDispatcher, CommandKind, CommandReply, PublisherCommand, PublisherTransport};
pub use source::SegmentSource;
pub use topology::{CacheTopology, SegmentOwners, TopologyOracle};

// Re-export partitioning types
pub use partitioning::{HashPartitioner, KeyPartitioner, SegmentRing};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, MetricsSnapshot, PublisherMetrics};

// Re-export testing types
pub use testing::{ChurnConfig, ChurnStats, MemoryNetwork, MemoryStore, TestCluster};
