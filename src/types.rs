//! Type-safe wrappers for stream position primitives.
//!
//! These newtypes prevent mixing up the two 64-bit position kinds a
//! partitioned stream exposes: the byte-level offset of an event within a
//! partition's log, and its logical sequence number.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one partition within a stream.
///
/// Partition ids are opaque strings assigned by the stream service; they sort
/// lexicographically, which the load balancer relies on for deterministic
/// tie-breaking.
pub type PartitionId = String;

/// Byte offset of an event within a partition's log.
///
/// # Special Values
///
/// - `-1` (`EARLIEST`): no recorded position; resume from the start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StreamOffset(pub i64);

impl StreamOffset {
    /// Sentinel meaning "no recorded offset".
    pub const EARLIEST: Self = StreamOffset(-1);

    /// Create a new offset from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        StreamOffset(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is a valid (non-negative) offset.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i64> for StreamOffset {
    fn from(value: i64) -> Self {
        StreamOffset(value)
    }
}

impl From<StreamOffset> for i64 {
    fn from(offset: StreamOffset) -> Self {
        offset.0
    }
}

impl fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical sequence number of an event within a partition.
///
/// Sequence numbers are assigned by the stream service, start at zero, and
/// are monotonically increasing within a partition. Checkpoints record them
/// so that a future owner can resume at-least-once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub i64);

impl SequenceNumber {
    /// Sentinel meaning "no event seen yet".
    pub const UNSET: Self = SequenceNumber(-1);

    /// Create a new sequence number from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        SequenceNumber(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is a valid (non-negative) sequence number.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The next sequence number after this one.
    #[inline]
    pub const fn next(self) -> Self {
        SequenceNumber(self.0 + 1)
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        SequenceNumber(value)
    }
}

impl From<SequenceNumber> for i64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
