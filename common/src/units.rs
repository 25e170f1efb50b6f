//! Stream units and wrap-aware arithmetic.
//!
//! Sequence numbers, sample timestamps, and FEC block numbers are small
//! unsigned integers that wrap during any long-lived stream. All ordering
//! decisions go through the signed-difference helpers here; direct `<`
//! comparisons on the raw values are a bug.

/// Packet source identifier (RTP SSRC).
pub type SourceId = u32;

/// Packet sequence number.
pub type Seqnum = u16;

/// Stream timestamp in samples.
pub type Timestamp = u32;

/// FEC block number.
pub type Blknum = u16;

/// Nanosecond time value.
pub type Nanoseconds = i64;

/// One millisecond in nanoseconds.
pub const MILLISECOND: Nanoseconds = 1_000_000;

/// One second in nanoseconds.
pub const SECOND: Nanoseconds = 1_000_000_000;

/// Computes the wrap-aware difference between two sequence numbers.
///
/// The result is meaningful as long as the live window of values spans
/// less than half the type's range.
pub fn seqnum_diff(a: Seqnum, b: Seqnum) -> i16 {
    // ---
    a.wrapping_sub(b) as i16
}

/// Returns whether `a` comes before `b`, accounting for wrap.
pub fn seqnum_lt(a: Seqnum, b: Seqnum) -> bool {
    seqnum_diff(a, b) < 0
}

/// Returns whether `a` comes before or at `b`, accounting for wrap.
pub fn seqnum_le(a: Seqnum, b: Seqnum) -> bool {
    seqnum_diff(a, b) <= 0
}

/// Computes the wrap-aware difference between two timestamps.
pub fn timestamp_diff(a: Timestamp, b: Timestamp) -> i32 {
    // ---
    a.wrapping_sub(b) as i32
}

/// Returns whether timestamp `a` comes before `b`, accounting for wrap.
pub fn timestamp_lt(a: Timestamp, b: Timestamp) -> bool {
    timestamp_diff(a, b) < 0
}

/// Returns whether timestamp `a` comes before or at `b`, accounting for wrap.
pub fn timestamp_le(a: Timestamp, b: Timestamp) -> bool {
    timestamp_diff(a, b) <= 0
}

/// Computes the wrap-aware difference between two FEC block numbers.
pub fn blknum_diff(a: Blknum, b: Blknum) -> i16 {
    // ---
    a.wrapping_sub(b) as i16
}

/// Returns whether block number `a` comes before `b`, accounting for wrap.
pub fn blknum_lt(a: Blknum, b: Blknum) -> bool {
    blknum_diff(a, b) < 0
}
