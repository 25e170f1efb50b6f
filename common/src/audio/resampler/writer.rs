//! Push-side resampler.
//!
//! Accumulates written frames into the three-frame window; each time the
//! window fills, resampled output frames are pushed to the downstream
//! writer.

use crate::audio::resampler::{Resampler, ResamplerConfig};
use crate::frame::{Frame, FrameWriter};
use crate::pool::{BufferPool, PooledBuffer};
use crate::sample::{Sample, SampleSpec};

/// Frame writer resampling into a downstream frame writer.
pub struct ResamplerWriter {
    resampler: Resampler,
    frames: [PooledBuffer<Sample>; 3],
    output: PooledBuffer<Sample>,
    frame_pos: usize,
    frame_size: usize,
}

impl ResamplerWriter {
    // ---
    /// Creates a resampling writer with window frames from `sample_pool`.
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
        let mut resampler = Resampler::new(config, sample_spec, frame_size)?;
        resampler.renew_window();

        let frames = [
            sample_pool.allocate()?,
            sample_pool.allocate()?,
            sample_pool.allocate()?,
        ];
        let output = sample_pool.allocate()?;

        Some(Self {
            resampler,
            frames,
            output,
            frame_pos: 0,
            frame_size,
        })
    }

    /// Updates the scaling factor; see [`Resampler::set_scaling`].
    pub fn set_scaling(&mut self, scaling: f32) -> bool {
        self.resampler.set_scaling(scaling)
    }

    /// Accumulates one input frame, pushing resampled frames downstream
    /// whenever the window fills.
    pub fn write(&mut self, input: &Frame, downstream: &mut dyn FrameWriter) {
        // ---
        let input_data = input.data();
        let mut input_pos = 0;

        while self.frame_pos < self.frame_size && input_pos < input_data.len() {
            self.frames[0][self.frame_pos] = input_data[input_pos];
            self.frame_pos += 1;
            input_pos += 1;
        }

        while self.frame_pos < self.frame_size * 2 && input_pos < input_data.len() {
            self.frames[1][self.frame_pos - self.frame_size] = input_data[input_pos];
            self.frame_pos += 1;
            input_pos += 1;
        }

        while input_pos < input_data.len() {
            while self.frame_pos < self.frame_size * 3 && input_pos < input_data.len() {
                self.frames[2][self.frame_pos - self.frame_size * 2] = input_data[input_pos];
                self.frame_pos += 1;
                input_pos += 1;
            }

            // Window full: emit as much output as it supports, then slide.
            if self.frame_pos >= self.frame_size * 3 {
                self.resampler.renew_window();

                loop {
                    let mut out_frame = Frame::new(&mut self.output);
                    let full = self.resampler.resample_buff(
                        &mut out_frame,
                        &self.frames[0],
                        &self.frames[1],
                        &self.frames[2],
                    );
                    if !full {
                        break;
                    }
                    downstream.write(&Frame::new(&mut self.output));
                }

                self.frame_pos -= self.frame_size;
                self.frames.rotate_left(1);
            }
        }
    }
}
