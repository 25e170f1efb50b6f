//! Mixer.
//!
//! Sums the frame streams of all live sessions into the receiver's output.
//! No saturation is applied; with the usual handful of sessions the sum
//! stays comfortably inside the sample range.

use tracing::debug;

use crate::frame::{Frame, FrameReader};
use crate::pool::{BufferPool, PooledBuffer};
use crate::sample::Sample;

/// Frame reader summing multiple upstream readers.
pub struct Mixer {
    scratch: PooledBuffer<Sample>,
}

impl Mixer {
    // ---
    /// Creates a mixer able to serve frames up to the pool's buffer size.
    ///
    /// Returns `None` when the scratch buffer cannot be allocated
    /// (construction error).
    pub fn new(sample_pool: &BufferPool<Sample>) -> Option<Self> {
        // ---
        let scratch = sample_pool.allocate()?;

        debug!("mixer: initializing: max_frame_size={}", scratch.len());

        Some(Self { scratch })
    }

    /// Fills `frame` with the sum of all `readers`.
    ///
    /// The output gap flags are the union of the inputs' flags.
    ///
    /// # Panics
    ///
    /// Panics if the frame is larger than the mixer's scratch buffer.
    pub fn read(&mut self, frame: &mut Frame, readers: &mut [&mut dyn FrameReader]) {
        // ---
        if frame.len() > self.scratch.len() {
            panic!(
                "mixer: frame too large: frame={} max={}",
                frame.len(),
                self.scratch.len()
            );
        }

        let len = frame.len();
        frame.data_mut().fill(0.0);
        let mut mixed_flags = 0;

        for reader in readers {
            let mut temp = Frame::new(&mut self.scratch[..len]);
            reader.read(&mut temp);
            mixed_flags |= temp.flags();

            for (out, add) in frame.data_mut().iter_mut().zip(self.scratch[..len].iter()) {
                *out += *add;
            }
        }

        frame.add_flags(mixed_flags);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::frame::flags;

    struct ConstReader(Sample, u32);

    impl FrameReader for ConstReader {
        fn read(&mut self, frame: &mut Frame) {
            frame.data_mut().fill(self.0);
            frame.add_flags(self.1);
        }
    }

    fn mixer() -> Mixer {
        let pool: BufferPool<Sample> = BufferPool::new("test", 64, 0);
        Mixer::new(&pool).unwrap()
    }

    #[test]
    fn test_sums_inputs() {
        // ---
        let mut mixer = mixer();
        let mut a = ConstReader(0.25, 0);
        let mut b = ConstReader(0.5, 0);

        let mut buf = vec![0.0; 8];
        let mut frame = Frame::new(&mut buf);
        mixer.read(&mut frame, &mut [&mut a, &mut b]);

        for s in buf {
            assert!((s - 0.75).abs() < 1e-6);
        }
    }

    #[test]
    fn test_no_inputs_produces_silence() {
        // ---
        let mut mixer = mixer();

        let mut buf = vec![1.0; 8];
        let mut frame = Frame::new(&mut buf);
        mixer.read(&mut frame, &mut []);

        assert!(buf.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_flags_are_merged() {
        // ---
        let mut mixer = mixer();
        let mut a = ConstReader(0.0, flags::INCOMPLETE);
        let mut b = ConstReader(0.0, 0);

        let mut buf = vec![0.0; 4];
        let mut frame = Frame::new(&mut buf);
        mixer.read(&mut frame, &mut [&mut a, &mut b]);

        assert_ne!(frame.flags() & flags::INCOMPLETE, 0);
    }
}
