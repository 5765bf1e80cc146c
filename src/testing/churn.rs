//! Randomized segment churn for liveness testing.
//!
//! A [`ChurnPlanner`] picks segments to move and their new owners. The
//! test cluster applies the moves while reductions and publishers run,
//! optionally with a random delay on every command.

use crate::topology::CacheTopology;
use crate::types::{NodeId, SegmentId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Configuration for churn testing.
#[derive(Debug, Clone)]
pub struct ChurnConfig {
    /// Number of segment moves to perform.
    pub moves: usize,

    /// Pause before every move.
    pub interval: Duration,

    /// Owners assigned to a moved segment.
    pub num_owners: usize,

    /// Minimum command delay.
    pub message_delay_min: Duration,

    /// Maximum command delay. Zero disables delays.
    pub message_delay_max: Duration,

    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            moves: 0,
            interval: Duration::from_millis(5),
            num_owners: 1,
            message_delay_min: Duration::ZERO,
            message_delay_max: Duration::ZERO,
            seed: None,
        }
    }
}

impl ChurnConfig {
    /// A few moves, no delays.
    pub fn light() -> Self {
        Self {
            moves: 4,
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Frequent moves with delayed commands.
    pub fn heavy() -> Self {
        Self {
            moves: 20,
            interval: Duration::from_millis(2),
            message_delay_min: Duration::from_millis(1),
            message_delay_max: Duration::from_millis(5),
            ..Default::default()
        }
    }

    /// No churn.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Command delay range, if delays are enabled.
    pub fn message_delay(&self) -> Option<(Duration, Duration)> {
        (self.message_delay_max > Duration::ZERO)
            .then(|| (self.message_delay_min.min(self.message_delay_max), self.message_delay_max))
    }
}

/// A segment and its next owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub segment: SegmentId,
    pub owners: Vec<NodeId>,
}

/// Picks random segment moves.
#[derive(Debug)]
pub struct ChurnPlanner {
    rng: StdRng,
    num_owners: usize,
}

impl ChurnPlanner {
    pub fn new(config: &ChurnConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            num_owners: config.num_owners.max(1),
        }
    }

    /// A move changing the owners of one segment of `topology`, or `None`
    /// when no such move exists.
    pub fn next_move(&mut self, topology: &CacheTopology) -> Option<PlannedMove> {
        let mut members = topology.members().to_vec();
        if members.len() < 2 || topology.num_segments() == 0 {
            return None;
        }

        for _ in 0..16 {
            let segment = self.rng.gen_range(0..topology.num_segments());
            members.shuffle(&mut self.rng);
            let owners: Vec<NodeId> = members.iter().copied().take(self.num_owners).collect();
            let current = topology
                .owners(segment)
                .map(|owners| owners.read_owners.clone())
                .unwrap_or_default();
            if owners != current {
                return Some(PlannedMove { segment, owners });
            }
        }
        None
    }
}

/// Counters of one churn run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChurnStats {
    /// Moves applied.
    pub moves: usize,
    /// Node-segment pairs that lost ownership.
    pub segments_lost: usize,
}
