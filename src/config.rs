//! Configuration types for segment publishers.

use crate::error::{Error, Result};
use std::time::Duration;

/// How the cache is backed by a persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// No store, or a private store per node.
    #[default]
    None,
    /// A store shared by every node, written synchronously.
    Shared,
    /// A shared store written asynchronously. Remote queues may hold
    /// entries the store has not seen yet, so reads go to primaries.
    SharedWriteBehind,
}

/// Configuration shared by the local and cluster publisher managers.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Number of segments the key space is split into.
    pub num_segments: u32,

    /// Default number of values per streaming round trip.
    pub batch_size: usize,

    /// Maximum concurrent workers for a parallel local reduction.
    /// The invoking task counts as one of them.
    pub parallelism: usize,

    /// Maximum concurrent inner subscriptions for a streaming publisher.
    pub max_inner_subscribers: usize,

    /// Keys per collator invocation for a parallel key-set reduction.
    pub key_window: usize,

    /// Entries per collator invocation for a parallel scan of a
    /// non-segmented source.
    pub non_segmented_batch: usize,

    /// Timeout for remote reduction commands.
    pub remote_timeout: Duration,

    /// Store configuration of the cache.
    pub store: StoreMode,

    /// Whether every node holds every segment.
    pub replicated: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            num_segments: 256,
            batch_size: 128,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_inner_subscribers: 4,
            key_window: 16,
            non_segmented_batch: 1024,
            remote_timeout: Duration::from_secs(15),
            store: StoreMode::None,
            replicated: false,
        }
    }
}

impl PublisherConfig {
    /// Create a configuration with the given segment count.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments,
            ..Default::default()
        }
    }

    /// Set the default streaming batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of parallel reduction workers.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the maximum number of concurrent inner subscriptions.
    pub fn with_max_inner_subscribers(mut self, max: usize) -> Self {
        self.max_inner_subscribers = max;
        self
    }

    /// Set the key window for parallel key-set reductions.
    pub fn with_key_window(mut self, window: usize) -> Self {
        self.key_window = window;
        self
    }

    /// Set the batch used when splitting a non-segmented scan.
    pub fn with_non_segmented_batch(mut self, batch: usize) -> Self {
        self.non_segmented_batch = batch;
        self
    }

    /// Set the remote command timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Set the store mode.
    pub fn with_store(mut self, store: StoreMode) -> Self {
        self.store = store;
        self
    }

    /// Mark the cache as replicated.
    pub fn with_replicated(mut self, replicated: bool) -> Self {
        self.replicated = replicated;
        self
    }

    /// Timeout applied to streaming commands, which may wait on a full batch.
    pub fn streaming_timeout(&self) -> Duration {
        self.remote_timeout * 3
    }

    /// Check the configuration for values the publishers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be positive".into()));
        }
        if self.max_inner_subscribers == 0 {
            return Err(Error::Config(
                "max_inner_subscribers must be positive".into(),
            ));
        }
        if self.key_window == 0 || self.non_segmented_batch == 0 {
            return Err(Error::Config("window sizes must be positive".into()));
        }
        Ok(())
    }
}
