//! Time bucketing helpers

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// One hour, the time span covered by a data family
pub const FAMILY_MILLIS: i64 = 60 * 60 * 1000;

/// Current time in milliseconds
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Start of the family containing `timestamp`
pub fn family_time(timestamp: Timestamp) -> Timestamp {
    timestamp - timestamp.rem_euclid(FAMILY_MILLIS)
}

/// Slot of `timestamp` inside its family for the given interval
pub fn slot_of(timestamp: Timestamp, interval_ms: i64) -> u16 {
    let offset = timestamp.rem_euclid(FAMILY_MILLIS);
    (offset / interval_ms.max(1)).min(u16::MAX as i64) as u16
}

/// Inclusive range of slots covered by a committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Smallest range covering both
    pub fn union(&self, other: &SlotRange) -> SlotRange {
        SlotRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Widen the range to include `slot`
    pub fn extend(&mut self, slot: u16) {
        self.start = self.start.min(slot);
        self.end = self.end.max(slot);
    }

    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}
