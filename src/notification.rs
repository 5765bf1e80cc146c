//! Per-segment notifications emitted by segment aware publishers.

use crate::types::SegmentId;
use serde::{Deserialize, Serialize};

/// A value tagged with its segment, or the end of a segment.
///
/// For any one subscriber, `SegmentComplete(s)` and `SegmentLost(s)` are
/// observed after the last value of `s` and before any value of a later
/// segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification<R> {
    Value { value: R, segment: SegmentId },
    /// All values of the segment were published.
    SegmentComplete(SegmentId),
    /// Ownership of the segment moved before it could be fully read.
    SegmentLost(SegmentId),
}

impl<R> Notification<R> {
    pub fn value(value: R, segment: SegmentId) -> Self {
        Notification::Value { value, segment }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Notification::SegmentLost(_))
    }

    pub fn into_value(self) -> Option<R> {
        match self {
            Notification::Value { value, .. } => Some(value),
            _ => None,
        }
    }
}
