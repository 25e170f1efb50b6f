//! Wall-clock pacing.
//!
//! Both orchestrators use a ticker when configured with the internal clock:
//! the processing thread sleeps until the wall-clock deadline of the next
//! sample position, so frames move at exactly the stream's sample rate.

use std::time::{Duration, Instant};

/// Who paces the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// The pipeline sleeps on its own ticker; reads and writes block until
    /// the stream position's wall-clock deadline.
    Internal,

    /// The caller paces the pipeline (e.g. a sound card callback).
    External,
}

/// Converts stream positions to wall-clock deadlines and sleeps until them.
pub struct Ticker {
    ticks_per_second: u64,
    start: Option<Instant>,
}

impl Ticker {
    // ---
    /// Creates a ticker counting `ticks_per_second` positions per second.
    pub fn new(ticks_per_second: u32) -> Self {
        // ---
        Self {
            ticks_per_second: ticks_per_second as u64,
            start: None,
        }
    }

    /// Blocks until the wall-clock time of position `ticks`.
    ///
    /// The epoch is fixed at the first call, so successive positions map to
    /// evenly spaced deadlines regardless of processing jitter.
    pub fn wait(&mut self, ticks: u64) {
        // ---
        let start = *self.start.get_or_insert_with(Instant::now);

        let deadline = start
            + Duration::from_nanos(ticks.saturating_mul(1_000_000_000) / self.ticks_per_second);

        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}
