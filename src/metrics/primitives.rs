//! Atomic metric primitives.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency buckets for publisher operations, in seconds.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0,
];

/// Cumulative histogram over fixed bucket boundaries.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    bounds: &'static [f64],
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum of observations in microseconds.
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            bounds,
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn observe(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start a timer that observes on drop.
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.to_vec(),
            bucket_counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            count: self.count(),
            sum: Duration::from_micros(self.sum_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Observes the elapsed time into its histogram when dropped.
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed());
    }
}

#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    /// Observations `<=` each bound.
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum: Duration,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.sum.as_nanos() / self.count as u128) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new("c");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::new("g");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new("h", LATENCY_BUCKETS);
        histogram.observe(Duration::from_micros(200));
        histogram.observe(Duration::from_millis(20));
        {
            let _timer = histogram.start_timer();
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 3);
        // 0.0005s bucket holds the 200us sample and the timer sample.
        assert!(snapshot.bucket_counts[0] >= 1);
        assert_eq!(*snapshot.bucket_counts.last().unwrap(), 3);
        assert!(snapshot.mean() > Duration::ZERO);
    }

    #[test]
    fn test_mean_of_large_counts() {
        let snapshot = HistogramSnapshot {
            bounds: LATENCY_BUCKETS.to_vec(),
            bucket_counts: vec![0; LATENCY_BUCKETS.len()],
            count: (1u64 << 32) + 2,
            sum: Duration::from_micros((1u64 << 32) + 2) * 3,
        };
        assert_eq!(snapshot.mean(), Duration::from_micros(3));

        let empty = HistogramSnapshot { count: 0, sum: Duration::ZERO, ..snapshot };
        assert_eq!(empty.mean(), Duration::ZERO);
    }
}
