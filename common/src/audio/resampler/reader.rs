//! Pull-side resampler.
//!
//! Keeps the three-frame input window filled by pulling from an upstream
//! frame reader whenever the core exhausts the current window.

use crate::audio::resampler::{Resampler, ResamplerConfig};
use crate::frame::{Frame, FrameReader};
use crate::pool::{BufferPool, PooledBuffer};
use crate::sample::{Sample, SampleSpec};

/// Frame reader resampling an upstream frame reader.
pub struct ResamplerReader {
    resampler: Resampler,
    frames: [PooledBuffer<Sample>; 3],
    frames_empty: bool,
}

impl ResamplerReader {
    // ---
    /// Creates a resampling reader with window frames from `sample_pool`.
    ///
    /// Returns `None` on invalid configuration or pool exhaustion
    /// (construction error).
    pub fn new(
        config: &ResamplerConfig,
        sample_spec: SampleSpec,
        sample_pool: &BufferPool<Sample>,
    ) -> Option<Self> {
        // ---
        let frame_size = sample_pool.buffer_size();
        let resampler = Resampler::new(config, sample_spec, frame_size)?;

        let frames = [
            sample_pool.allocate()?,
            sample_pool.allocate()?,
            sample_pool.allocate()?,
        ];

        Some(Self {
            resampler,
            frames,
            frames_empty: true,
        })
    }

    /// Updates the scaling factor; see [`Resampler::set_scaling`].
    pub fn set_scaling(&mut self, scaling: f32) -> bool {
        self.resampler.set_scaling(scaling)
    }

    /// Fills one output frame, pulling input frames as needed.
    pub fn read(&mut self, frame: &mut Frame, upstream: &mut dyn FrameReader) {
        // ---
        if self.frames_empty {
            self.renew_frames(upstream);
        }

        loop {
            let done = self.resampler.resample_buff(
                frame,
                &self.frames[0],
                &self.frames[1],
                &self.frames[2],
            );
            if done {
                break;
            }
            self.renew_frames(upstream);
        }
    }

    fn renew_frames(&mut self, upstream: &mut dyn FrameReader) {
        // ---
        if self.frames_empty {
            for buffer in self.frames.iter_mut() {
                let mut frame = Frame::new(buffer);
                upstream.read(&mut frame);
            }
            self.frames_empty = false;
        } else {
            self.frames.rotate_left(1);
            let mut frame = Frame::new(&mut self.frames[2]);
            upstream.read(&mut frame);
        }

        self.resampler.renew_window();
    }
}
