//! Metrics for publisher operations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PublisherMetrics                       │
//! │  Counters               Gauges            Histograms     │
//! │  - reductions           - open sessions   - reduction    │
//! │  - retries                                  latency      │
//! │  - suspected segments                                    │
//! │  - remote commands                                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Metrics are plain atomics; exporting them is left to the embedding
//! application via [`PublisherMetrics::snapshot`].

mod primitives;

pub use primitives::{
    Counter, Gauge, Histogram, HistogramSnapshot, HistogramTimer, LATENCY_BUCKETS,
};

/// Metrics of one node's publisher managers and handler.
#[derive(Debug)]
pub struct PublisherMetrics {
    /// Cluster reductions started.
    pub reductions_started: Counter,
    /// Cluster reductions that ended with an error.
    pub reductions_failed: Counter,
    /// Cluster streaming publishers started.
    pub publishers_started: Counter,
    /// Retry rounds after suspicion.
    pub retries: Counter,
    /// Segments reported suspected by a sub-call.
    pub suspected_segments: Counter,
    /// Keys reported suspected by a sub-call.
    pub suspected_keys: Counter,
    /// Commands sent to remote nodes.
    pub remote_commands: Counter,
    /// Local reductions executed.
    pub local_reductions: Counter,
    /// Segments dropped by `segments_lost`.
    pub segments_lost: Counter,
    /// Open streaming sessions in the handler.
    pub open_sessions: Gauge,
    /// Cluster reduction latency.
    pub reduction_latency: Histogram,
}

impl PublisherMetrics {
    pub fn new() -> Self {
        Self {
            reductions_started: Counter::new("publisher_reductions_started_total"),
            reductions_failed: Counter::new("publisher_reductions_failed_total"),
            publishers_started: Counter::new("publisher_streams_started_total"),
            retries: Counter::new("publisher_retries_total"),
            suspected_segments: Counter::new("publisher_suspected_segments_total"),
            suspected_keys: Counter::new("publisher_suspected_keys_total"),
            remote_commands: Counter::new("publisher_remote_commands_total"),
            local_reductions: Counter::new("publisher_local_reductions_total"),
            segments_lost: Counter::new("publisher_segments_lost_total"),
            open_sessions: Gauge::new("publisher_open_sessions"),
            reduction_latency: Histogram::new(
                "publisher_reduction_latency_seconds",
                LATENCY_BUCKETS,
            ),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reductions_started: self.reductions_started.get(),
            reductions_failed: self.reductions_failed.get(),
            publishers_started: self.publishers_started.get(),
            retries: self.retries.get(),
            suspected_segments: self.suspected_segments.get(),
            suspected_keys: self.suspected_keys.get(),
            remote_commands: self.remote_commands.get(),
            local_reductions: self.local_reductions.get(),
            segments_lost: self.segments_lost.get(),
            open_sessions: self.open_sessions.get(),
            reduction_latency: self.reduction_latency.snapshot(),
        }
    }
}

impl Default for PublisherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`PublisherMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub reductions_started: u64,
    pub reductions_failed: u64,
    pub publishers_started: u64,
    pub retries: u64,
    pub suspected_segments: u64,
    pub suspected_keys: u64,
    pub remote_commands: u64,
    pub local_reductions: u64,
    pub segments_lost: u64,
    pub open_sessions: i64,
    pub reduction_latency: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PublisherMetrics::new();
        metrics.retries.inc();
        metrics.suspected_segments.inc_by(3);
        metrics.open_sessions.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.suspected_segments, 3);
        assert_eq!(snapshot.open_sessions, 1);
        assert_eq!(snapshot.reduction_latency.count, 0);
    }
}
