//! Adaptive sinc resampler.
//!
//! Arbitrary, dynamically adjustable rate conversion. The interpolation
//! kernel is a windowed sinc evaluated from a precomputed table; the read
//! pointer through the input is a fixed-point accumulator so output is
//! bit-exact across platforms. Three consecutive input frames are kept so
//! the kernel can span frame boundaries.
//!
//! Scaling is the output-to-input rate ratio: the step through the input
//! per output sample is `1 / scaling`. The latency monitor nudges the
//! scaling at runtime to cancel clock drift between sender and receiver.

mod reader;
mod writer;

pub use reader::ResamplerReader;
pub use writer::ResamplerWriter;

use tracing::{debug, error};

use crate::frame::Frame;
use crate::sample::{Sample, SampleSpec};

/// Fixed-point phase value with 20 fractional bits.
type FixedPoint = u32;

type LongFixedPoint = u64;

const INTEGER_PART_MASK: u32 = 0xFFF0_0000;
const FRACT_PART_MASK: u32 = 0x000F_FFFF;
const FRACT_BIT_COUNT: u32 = 20;

// One in fixed-point terms.
const QT_ONE: FixedPoint = 1 << FRACT_BIT_COUNT;

fn float_to_fixedpoint(t: f32) -> FixedPoint {
    (t * QT_ONE as f32) as FixedPoint
}

fn fixedpoint_to_size(t: FixedPoint) -> usize {
    (t >> FRACT_BIT_COUNT) as usize
}

// Rounds x upward.
fn qceil(x: FixedPoint) -> FixedPoint {
    // ---
    if x & FRACT_PART_MASK == 0 {
        x & INTEGER_PART_MASK
    } else {
        (x & INTEGER_PART_MASK).wrapping_add(QT_ONE)
    }
}

// Rounds x downward.
fn qfloor(x: FixedPoint) -> FixedPoint {
    x & INTEGER_PART_MASK
}

// Fractional part of x.
fn fractional(x: FixedPoint) -> f32 {
    (x & FRACT_PART_MASK) as f32 * (1.0 / QT_ONE as f32)
}

/// Resampler quality profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplerProfile {
    /// No resampling stage.
    Disable,

    /// Cheap and rough.
    Low,

    /// Default trade-off.
    Medium,

    /// Expensive and clean.
    High,
}

/// Resampler kernel parameters.
#[derive(Debug, Clone)]
pub struct ResamplerConfig {
    /// Sinc kernel taps per side.
    pub window_size: usize,

    /// Table entries between two integer taps; must be a power of two.
    pub window_interp: usize,
}

impl ResamplerConfig {
    // ---
    /// Returns the parameters for a profile.
    ///
    /// `Disable` maps to the medium parameters; the caller is expected to
    /// skip the stage entirely instead.
    pub fn from_profile(profile: ResamplerProfile) -> Self {
        // ---
        match profile {
            ResamplerProfile::Low => Self {
                window_size: 16,
                window_interp: 64,
            },
            ResamplerProfile::Disable | ResamplerProfile::Medium => Self {
                window_size: 32,
                window_interp: 128,
            },
            ResamplerProfile::High => Self {
                window_size: 64,
                window_interp: 256,
            },
        }
    }
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self::from_profile(ResamplerProfile::Medium)
    }
}

/// Windowed-sinc rate converter over a three-frame window.
pub struct Resampler {
    num_channels: usize,

    out_frame_pos: usize,

    // Step through the input per output sample (1 / scaling).
    step: f32,

    frame_size: usize,
    frame_size_ch: usize,

    window_size: usize,
    window_interp_bits: u32,

    sinc_table: Vec<f32>,

    qt_half_window_size: FixedPoint,
    qt_epsilon: FixedPoint,
    qt_frame_size: FixedPoint,
    qt_sample: FixedPoint,
    qt_dt: FixedPoint,
    qt_sinc_step: FixedPoint,

    cutoff_freq: f32,
}

impl Resampler {
    // ---
    /// Creates a resampler for frames of `frame_size` interleaved samples.
    ///
    /// Returns `None` on an invalid configuration (construction error).
    pub fn new(config: &ResamplerConfig, sample_spec: SampleSpec, frame_size: usize) -> Option<Self> {
        // ---
        let num_channels = sample_spec.num_channels();
        let frame_size_ch = if num_channels != 0 {
            frame_size / num_channels
        } else {
            0
        };

        if !check_config(config, num_channels, frame_size, frame_size_ch) {
            return None;
        }

        let cutoff_freq = 0.9;

        let mut resampler = Self {
            num_channels,
            out_frame_pos: 0,
            step: 1.0,
            frame_size,
            frame_size_ch,
            window_size: config.window_size,
            window_interp_bits: config.window_interp.trailing_zeros(),
            sinc_table: Vec::new(),
            qt_half_window_size: float_to_fixedpoint(config.window_size as f32 / cutoff_freq),
            qt_epsilon: float_to_fixedpoint(5e-8),
            qt_frame_size: (frame_size_ch as FixedPoint) << FRACT_BIT_COUNT,
            qt_sample: 0,
            qt_dt: 0,
            qt_sinc_step: float_to_fixedpoint(cutoff_freq),
            cutoff_freq,
        };

        resampler.fill_sinc(config.window_interp);

        debug!(
            "resampler: initializing: window_interp={} window_size={} frame_size={} num_channels={}",
            config.window_interp, config.window_size, frame_size, num_channels
        );

        Some(resampler)
    }

    /// Updates the output-to-input rate ratio.
    ///
    /// Returns `false` when the implied window no longer fits the frame
    /// size (extreme downsampling); the previous scaling stays in effect.
    pub fn set_scaling(&mut self, scaling: f32) -> bool {
        // ---
        if scaling <= 0.0 {
            error!("resampler: invalid scaling: scaling={}", scaling);
            return false;
        }

        let step = 1.0 / scaling;

        // The window stretches with the step; deny changes that would make
        // it overrun the frames.
        if self.window_size as f32 * step >= self.frame_size_ch as f32 {
            error!(
                "resampler: scaling does not fit frame size: window_size={} frame_size={} scaling={:.5}",
                self.window_size, self.frame_size, scaling
            );
            return false;
        }

        if step > 1.0 {
            // Downsampling: lower the filter's edge frequency and widen the
            // window accordingly.
            let new_qt_half_window =
                float_to_fixedpoint(self.window_size as f32 / self.cutoff_freq * step);

            let out_of_bounds = fixedpoint_to_size(qceil(
                self.qt_frame_size.wrapping_sub(new_qt_half_window),
            )) > self.frame_size_ch
                || fixedpoint_to_size(qfloor(new_qt_half_window)) + 1 > self.frame_size_ch;

            if out_of_bounds {
                error!(
                    "resampler: scaling does not fit window size: window_size={} frame_size={} scaling={:.5}",
                    self.window_size, self.frame_size, scaling
                );
                return false;
            }

            self.qt_sinc_step = float_to_fixedpoint(self.cutoff_freq / step);
            self.qt_half_window_size = new_qt_half_window;
        } else {
            self.qt_sinc_step = float_to_fixedpoint(self.cutoff_freq);
            self.qt_half_window_size =
                float_to_fixedpoint(self.window_size as f32 / self.cutoff_freq);
        }

        self.step = step;
        true
    }

    /// Rebases the read pointer after the window slid one frame forward.
    ///
    /// The step is (re)latched here so a scaling change takes effect at a
    /// frame boundary and stays smooth inside one.
    pub fn renew_window(&mut self) {
        // ---
        debug_assert!((self.window_size as f32 * self.step) < self.frame_size_ch as f32);

        if self.qt_sample >= self.qt_frame_size {
            self.qt_sample = self.qt_sample.wrapping_sub(self.qt_frame_size);
        }

        self.qt_dt = float_to_fixedpoint(self.step);
    }

    /// Produces output samples until the output frame is full (`true`) or
    /// the input window is exhausted (`false`; slide the window and call
    /// again).
    pub fn resample_buff(
        &mut self,
        out: &mut Frame,
        prev: &[Sample],
        curr: &[Sample],
        next: &[Sample],
    ) -> bool {
        // ---
        debug_assert_eq!(prev.len(), self.frame_size);
        debug_assert_eq!(curr.len(), self.frame_size);
        debug_assert_eq!(next.len(), self.frame_size);

        while self.out_frame_pos < out.len() {
            if self.qt_sample >= self.qt_frame_size {
                return false;
            }

            if (self.qt_sample & FRACT_PART_MASK) < self.qt_epsilon {
                self.qt_sample &= INTEGER_PART_MASK;
            } else if QT_ONE - (self.qt_sample & FRACT_PART_MASK) < self.qt_epsilon {
                self.qt_sample &= INTEGER_PART_MASK;
                self.qt_sample = self.qt_sample.wrapping_add(QT_ONE);
            }

            for channel in 0..self.num_channels {
                out.data_mut()[self.out_frame_pos + channel] =
                    self.resample_one(channel, prev, curr, next);
            }
            self.qt_sample = self.qt_sample.wrapping_add(self.qt_dt);
            self.out_frame_pos += self.num_channels;
        }

        self.out_frame_pos = 0;
        true
    }

    fn fill_sinc(&mut self, window_interp: usize) {
        // ---
        let table_size = self.window_size * window_interp + 2;
        self.sinc_table = vec![0.0; table_size];

        let sinc_step = 1.0 / window_interp as f64;
        let mut sinc_t = sinc_step;

        self.sinc_table[0] = 1.0;
        for i in 1..table_size {
            let window = 0.54
                - 0.46
                    * (2.0 * std::f64::consts::PI
                        * ((i - 1) as f64 / 2.0 / table_size as f64 + 0.5))
                        .cos();
            self.sinc_table[i] =
                ((std::f64::consts::PI * sinc_t).sin() / std::f64::consts::PI / sinc_t * window)
                    as f32;
            sinc_t += sinc_step;
        }
        self.sinc_table[table_size - 2] = 0.0;
        self.sinc_table[table_size - 1] = 0.0;
    }

    // Sinc value at position x, linearly interpolated between table entries.
    fn sinc(&self, x: FixedPoint, fract_x: f32) -> Sample {
        // ---
        let index = (x >> (FRACT_BIT_COUNT - self.window_interp_bits)) as usize;

        let hl = self.sinc_table[index];
        let hh = self.sinc_table[index + 1];

        let result = hl + fract_x * (hh - hl);

        if self.step > 1.0 {
            result / self.step
        } else {
            result
        }
    }

    fn resample_one(
        &self,
        channel_offset: usize,
        prev: &[Sample],
        curr: &[Sample],
        next: &[Sample],
    ) -> Sample {
        // ---
        let channelize = |index: usize| index * self.num_channels + channel_offset;

        // Index of the first input sample in the window, within prev.
        let ind_end_prev = channelize(self.frame_size_ch);
        let ind_begin_prev = if self.qt_sample >= self.qt_half_window_size {
            self.frame_size_ch
        } else {
            fixedpoint_to_size(qceil(
                self.qt_sample
                    .wrapping_add(self.qt_frame_size.wrapping_sub(self.qt_half_window_size)),
            ))
        };
        debug_assert!(ind_begin_prev <= self.frame_size_ch);
        let ind_begin_prev = channelize(ind_begin_prev);

        let ind_begin_cur = if self.qt_sample >= self.qt_half_window_size {
            fixedpoint_to_size(qceil(self.qt_sample - self.qt_half_window_size))
        } else {
            0
        };
        debug_assert!(ind_begin_cur <= self.frame_size_ch);
        let ind_begin_cur = channelize(ind_begin_cur);

        let ind_end_cur = if self.qt_sample.wrapping_add(self.qt_half_window_size)
            > self.qt_frame_size
        {
            self.frame_size_ch - 1
        } else {
            fixedpoint_to_size(qfloor(self.qt_sample + self.qt_half_window_size))
        };
        debug_assert!(ind_end_cur <= self.frame_size_ch);
        let ind_end_cur = channelize(ind_end_cur);

        let ind_begin_next = channelize(0);
        let ind_end_next = if self.qt_sample.wrapping_add(self.qt_half_window_size)
            > self.qt_frame_size
        {
            fixedpoint_to_size(qfloor(
                self.qt_sample + self.qt_half_window_size - self.qt_frame_size,
            )) + 1
        } else {
            0
        };
        debug_assert!(ind_end_next <= self.frame_size_ch);
        let ind_end_next = channelize(ind_end_next);

        // Sinc counter at the left edge of the window.
        let qt_cur = self.qt_frame_size as LongFixedPoint + self.qt_sample as LongFixedPoint
            - qceil(
                self.qt_frame_size
                    .wrapping_add(self.qt_sample)
                    .wrapping_sub(self.qt_half_window_size),
            ) as LongFixedPoint;
        let mut qt_sinc_cur =
            ((qt_cur * self.qt_sinc_step as LongFixedPoint) >> FRACT_BIT_COUNT) as FixedPoint;

        let qt_sinc_inc = self.qt_sinc_step;

        // The fractional part of the table position stays constant across
        // the window walk.
        let mut f_sinc_cur_fract = fractional(qt_sinc_cur.wrapping_shl(self.window_interp_bits));
        let mut accumulator: Sample = 0.0;

        let mut i = ind_begin_prev;
        while i < ind_end_prev {
            accumulator += prev[i] * self.sinc(qt_sinc_cur, f_sinc_cur_fract);
            qt_sinc_cur = qt_sinc_cur.wrapping_sub(qt_sinc_inc);
            i += self.num_channels;
        }

        // Left side of the window inside curr; the counter decreases until
        // it crosses zero.
        i = ind_begin_cur;
        accumulator += curr[i] * self.sinc(qt_sinc_cur, f_sinc_cur_fract);
        while qt_sinc_cur >= self.qt_sinc_step {
            i += self.num_channels;
            qt_sinc_cur -= qt_sinc_inc;
            accumulator += curr[i] * self.sinc(qt_sinc_cur, f_sinc_cur_fract);
        }

        i += self.num_channels;
        debug_assert!(i <= channelize(self.frame_size_ch));

        // Crossing zero only mirrors the counter.
        qt_sinc_cur = self.qt_sinc_step - qt_sinc_cur;
        f_sinc_cur_fract = fractional(qt_sinc_cur.wrapping_shl(self.window_interp_bits));

        while i <= ind_end_cur {
            accumulator += curr[i] * self.sinc(qt_sinc_cur, f_sinc_cur_fract);
            qt_sinc_cur = qt_sinc_cur.wrapping_add(qt_sinc_inc);
            i += self.num_channels;
        }

        i = ind_begin_next;
        while i < ind_end_next {
            accumulator += next[i] * self.sinc(qt_sinc_cur, f_sinc_cur_fract);
            qt_sinc_cur = qt_sinc_cur.wrapping_add(qt_sinc_inc);
            i += self.num_channels;
        }

        accumulator
    }
}

fn check_config(
    config: &ResamplerConfig,
    num_channels: usize,
    frame_size: usize,
    frame_size_ch: usize,
) -> bool {
    // ---
    if num_channels < 1 {
        error!("resampler: invalid num_channels: num_channels={}", num_channels);
        return false;
    }

    if frame_size != frame_size_ch * num_channels {
        error!(
            "resampler: frame_size is not multiple of num_channels: frame_size={} num_channels={}",
            frame_size, num_channels
        );
        return false;
    }

    let max_frame_size = (u32::MAX >> FRACT_BIT_COUNT) as usize * num_channels;
    if frame_size > max_frame_size {
        error!(
            "resampler: frame_size is too much: max_frame_size={} frame_size={} num_channels={}",
            max_frame_size, frame_size, num_channels
        );
        return false;
    }

    if !config.window_interp.is_power_of_two() {
        error!(
            "resampler: window_interp is not power of two: window_interp={}",
            config.window_interp
        );
        return false;
    }

    true
}
