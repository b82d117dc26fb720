//! Core types for TideDB

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp key in the repository's configured precision
pub type TsKey = i64;

/// Identity of a table: an opaque user id plus a dense table id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Opaque user-assigned id; must match on every insert
    pub uid: u64,
    /// Dense index into the table registry, `0 <= tid < max_tables`
    pub tid: i32,
}

impl TableId {
    /// Create a new table identity
    pub fn new(uid: u64, tid: i32) -> Self {
        Self { uid, tid }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.tid)
    }
}

/// Time unit of all keys stored in a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[repr(i8)]
pub enum Precision {
    /// Milliseconds since the epoch
    Milli = 0,
    /// Microseconds since the epoch
    Micro = 1,
    /// Nanoseconds since the epoch
    Nano = 2,
}

impl Precision {
    /// Number of key units in one day at this precision
    pub fn units_per_day(self) -> i64 {
        match self {
            Precision::Milli => 86_400_000,
            Precision::Micro => 86_400_000_000,
            Precision::Nano => 86_400_000_000_000,
        }
    }

    /// Decode from the on-disk i8 representation
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            0 => Some(Precision::Milli),
            1 => Some(Precision::Micro),
            2 => Some(Precision::Nano),
            _ => None,
        }
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start key (inclusive)
    pub start: TsKey,
    /// End key (inclusive)
    pub end: TsKey,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: TsKey, end: TsKey) -> Self {
        Self { start, end }
    }

    /// Check if a key is within the range
    pub fn contains(&self, key: TsKey) -> bool {
        key >= self.start && key <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

/// Width of one file partition in key units
pub fn partition_span(days_per_file: i32, precision: Precision) -> i64 {
    days_per_file as i64 * precision.units_per_day()
}

/// File partition id covering the given key.
///
/// Floor division, so keys before the epoch land in negative partitions
/// rather than sharing partition 0 with positive keys.
pub fn file_id_of(key: TsKey, days_per_file: i32, precision: Precision) -> i32 {
    key.div_euclid(partition_span(days_per_file, precision)) as i32
}

/// Inclusive key range covered by a file partition
pub fn file_key_range(fid: i32, days_per_file: i32, precision: Precision) -> TimeRange {
    let span = partition_span(days_per_file, precision);
    let start = fid as i64 * span;
    TimeRange::new(start, start + span - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_per_day() {
        assert_eq!(Precision::Milli.units_per_day(), 86_400_000);
        assert_eq!(Precision::Nano.units_per_day() % Precision::Micro.units_per_day(), 0);
    }

    #[test]
    fn test_file_id_boundaries() {
        // One-day partitions at millisecond precision
        assert_eq!(file_id_of(0, 1, Precision::Milli), 0);
        assert_eq!(file_id_of(86_399_999, 1, Precision::Milli), 0);
        assert_eq!(file_id_of(86_400_000, 1, Precision::Milli), 1);
        assert_eq!(file_id_of(-1, 1, Precision::Milli), -1);
    }

    #[test]
    fn test_file_key_range_covers_partition() {
        let range = file_key_range(1, 1, Precision::Milli);
        assert_eq!(range.start, 86_400_000);
        assert_eq!(range.end, 172_799_999);
        assert!(range.contains(86_400_000));
        assert!(!range.contains(86_399_999));
    }

    #[test]
    fn test_range_overlaps() {
        let a = TimeRange::new(100, 200);
        let b = TimeRange::new(150, 250);
        let c = TimeRange::new(300, 400);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_key_to_range_round_trip() {
        for key in [0i64, 123, 86_399_000, 86_400_000, 172_800_000, -5] {
            let fid = file_id_of(key, 1, Precision::Milli);
            assert!(file_key_range(fid, 1, Precision::Milli).contains(key));
        }
    }
}
