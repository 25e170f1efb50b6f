//! PCM payload codec (L16).
//!
//! Packs float samples into signed big-endian 16-bit payload bytes and back.
//! When the payload channel layout differs from the caller's sample spec,
//! channels are remapped by walking the union of both masks: channels absent
//! from the payload decode as zero, channels absent from the caller's spec
//! are dropped.
//!
//! `begin`/`end` must be paired; violating the pairing is a programmer error
//! and panics.

use crate::rtp::PcmFormat;
use crate::sample::{Sample, SampleSpec};
use crate::units::Timestamp;

fn encode_one(s: Sample) -> [u8; 2] {
    // ---
    let scaled = (s * 32768.0).clamp(-32768.0, 32767.0);
    (scaled as i16).to_be_bytes()
}

fn decode_one(bytes: [u8; 2]) -> Sample {
    i16::from_be_bytes(bytes) as Sample / 32768.0
}

/// Incremental payload encoder.
///
/// One packet's payload is produced by `begin`, any number of `write` calls,
/// then `end`. The encoder only tracks the write offset; the payload buffer
/// itself belongs to the packet and is passed to each `write`.
pub struct PcmEncoder {
    format: PcmFormat,
    active: bool,
    frame_pos: usize,
}

impl PcmEncoder {
    // ---
    /// Creates an encoder for the given payload layout.
    pub fn new(format: PcmFormat) -> Self {
        // ---
        Self {
            format,
            active: false,
            frame_pos: 0,
        }
    }

    /// Returns payload bytes needed for `n_samples` samples per channel.
    pub fn encoded_size(&self, n_samples: usize) -> usize {
        self.format.payload_size_from_samples(n_samples)
    }

    /// Starts a new payload.
    pub fn begin(&mut self) {
        // ---
        if self.active {
            panic!("pcm encoder: unpaired begin/end");
        }
        self.active = true;
        self.frame_pos = 0;
    }

    /// Appends up to `n_samples` samples per channel from `samples` (laid
    /// out per `sample_spec`) into `payload`. Returns how many samples per
    /// channel were written.
    pub fn write(
        &mut self,
        payload: &mut [u8],
        samples: &[Sample],
        n_samples: usize,
        sample_spec: &SampleSpec,
    ) -> usize {
        // ---
        if !self.active {
            panic!("pcm encoder: write should be called only between begin/end");
        }

        let out_mask = self.format.channel_mask();
        let in_mask = sample_spec.channel_mask();
        let union_mask = out_mask | in_mask;
        let out_channels = self.format.num_channels();

        let payload_samples = payload.len() / out_channels / 2;
        let off = self.frame_pos.min(payload_samples);
        let n_samples = n_samples.min(payload_samples - off);

        let mut out = off * out_channels * 2;
        let mut input = samples.iter();

        for _ in 0..n_samples {
            let mut ch = 1u32;
            while ch != 0 && ch <= union_mask {
                if in_mask & ch != 0 {
                    let s = *input.next().unwrap_or(&0.0);
                    if out_mask & ch != 0 {
                        payload[out..out + 2].copy_from_slice(&encode_one(s));
                        out += 2;
                    }
                } else if out_mask & ch != 0 {
                    payload[out..out + 2].copy_from_slice(&encode_one(0.0));
                    out += 2;
                }
                ch <<= 1;
            }
        }

        self.frame_pos += n_samples;
        n_samples
    }

    /// Finishes the payload.
    pub fn end(&mut self) {
        // ---
        if !self.active {
            panic!("pcm encoder: unpaired begin/end");
        }
        self.active = false;
        self.frame_pos = 0;
    }
}

/// Incremental payload decoder.
///
/// Tracks the stream position of the payload being decoded so the
/// depacketizer can align packets against its playout timestamp and decode
/// packets partially across frame boundaries.
pub struct PcmDecoder {
    format: PcmFormat,
    stream_pos: Timestamp,
    stream_avail: Timestamp,
    frame_pos: usize,
    active: bool,
}

impl PcmDecoder {
    // ---
    /// Creates a decoder for the given payload layout.
    pub fn new(format: PcmFormat) -> Self {
        // ---
        Self {
            format,
            stream_pos: 0,
            stream_avail: 0,
            frame_pos: 0,
            active: false,
        }
    }

    /// Returns the stream timestamp of the next sample to decode.
    pub fn position(&self) -> Timestamp {
        self.stream_pos
    }

    /// Returns how many samples per channel remain in the payload.
    pub fn available(&self) -> Timestamp {
        self.stream_avail
    }

    /// Starts decoding a payload whose first sample has stream timestamp
    /// `position`.
    pub fn begin(&mut self, position: Timestamp, payload_len: usize) {
        // ---
        if self.active {
            panic!("pcm decoder: unpaired begin/end");
        }

        self.active = true;
        self.stream_pos = position;
        self.stream_avail = self.format.samples_from_payload_size(payload_len) as Timestamp;
        self.frame_pos = 0;
    }

    /// Decodes up to `n_samples` samples per channel from `payload` into
    /// `samples` (laid out per `sample_spec`). Returns how many samples per
    /// channel were produced.
    pub fn read(
        &mut self,
        payload: &[u8],
        samples: &mut [Sample],
        n_samples: usize,
        sample_spec: &SampleSpec,
    ) -> usize {
        // ---
        if !self.active {
            panic!("pcm decoder: read should be called only between begin/end");
        }

        let n_samples = n_samples.min(self.stream_avail as usize);

        let in_mask = self.format.channel_mask();
        let out_mask = sample_spec.channel_mask();
        let union_mask = in_mask | out_mask;
        let in_channels = self.format.num_channels();

        let mut input = self.frame_pos * in_channels * 2;
        let mut out = samples.iter_mut();

        for _ in 0..n_samples {
            let mut ch = 1u32;
            while ch != 0 && ch <= union_mask {
                let mut s = 0.0;
                if in_mask & ch != 0 {
                    s = decode_one([payload[input], payload[input + 1]]);
                    input += 2;
                }
                if out_mask & ch != 0 {
                    if let Some(slot) = out.next() {
                        *slot = s;
                    }
                }
                ch <<= 1;
            }
        }

        self.shift(n_samples);
        n_samples
    }

    /// Skips `n_samples` samples per channel of the payload. Returns how
    /// many were actually skipped.
    pub fn shift(&mut self, n_samples: usize) -> usize {
        // ---
        if !self.active {
            panic!("pcm decoder: shift should be called only between begin/end");
        }

        let n_samples = n_samples.min(self.stream_avail as usize);

        self.stream_pos = self.stream_pos.wrapping_add(n_samples as Timestamp);
        self.stream_avail -= n_samples as Timestamp;
        self.frame_pos += n_samples;

        n_samples
    }

    /// Finishes the payload.
    pub fn end(&mut self) {
        // ---
        if !self.active {
            panic!("pcm decoder: unpaired begin/end");
        }

        self.active = false;
        self.stream_avail = 0;
        self.frame_pos = 0;
    }
}
