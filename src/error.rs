//! Error types for segment publishers.

use crate::types::{NodeId, RequestId};
use thiserror::Error;

/// Result type alias for publisher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for local and clustered publisher operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Cluster availability degraded while the operation was in flight.
    #[error("cluster is not available: partition degraded")]
    PartitionDegraded,

    /// The cache is no longer running on the target node.
    #[error("cache not running on node {node}")]
    CacheNotRunning { node: NodeId },

    /// The target node left the cluster or is suspected of having left.
    #[error("node {node} suspected")]
    NodeSuspected { node: NodeId },

    /// A remote node failed while serving a command.
    #[error("remote error: {0}")]
    Remote(String),

    /// The transport could not deliver a command.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transformer, collator or finalizer failed.
    #[error("user function failed: {0}")]
    UserCode(String),

    /// A protocol or session invariant was violated.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Decoded an unknown delivery guarantee.
    #[error("unsupported delivery guarantee: {0}")]
    UnsupportedDeliveryGuarantee(u8),

    /// No publisher session is registered under this request id.
    #[error("no publisher registered for request {0}")]
    PublisherNotFound(RequestId),

    /// A key was supplied outside of the requested segments.
    #[error("key maps to segment {segment}, which was not requested")]
    KeyOutsideSegments { segment: u32 },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The publisher manager has been stopped.
    #[error("publisher manager is not running")]
    LifecycleStopped,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Whether the error means the target can no longer serve its share and
    /// everything requested from it should be retried elsewhere.
    pub fn is_target_unavailable(&self) -> bool {
        matches!(
            self,
            Error::CacheNotRunning { .. } | Error::NodeSuspected { .. }
        )
    }

    /// Wrap a failure raised by user supplied code.
    pub fn user(err: impl std::fmt::Display) -> Self {
        Error::UserCode(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::IllegalState(format!("worker task panicked: {err}"))
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
