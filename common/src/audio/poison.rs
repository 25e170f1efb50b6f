//! Debug poisoning.
//!
//! When poisoning is enabled, a poison stage overwrites the frame buffer
//! with a loud sentinel value before handing it to the upstream reader, so
//! samples an upstream stage forgot to fill stand out immediately instead
//! of passing as stale-but-plausible audio.

use crate::frame::{Frame, FrameReader};
use crate::sample::Sample;

/// Sentinel value well outside the normal sample range.
const POISON_VALUE: Sample = 100_000.0;

/// Overwrites a frame buffer with the sentinel pattern.
pub fn poison_frame(frame: &mut Frame) {
    frame.data_mut().fill(POISON_VALUE);
}

/// Frame reader poisoning the buffer before delegating upstream.
pub struct PoisonReader;

impl PoisonReader {
    // ---
    /// Poisons the frame, then lets `upstream` fill it.
    pub fn read(&mut self, frame: &mut Frame, upstream: &mut dyn FrameReader) {
        // ---
        poison_frame(frame);
        upstream.read(frame);
    }
}
