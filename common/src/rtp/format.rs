//! RTP payload formats.
//!
//! Maps payload type numbers to the sample spec and PCM layout of the
//! payload, per the RFC 3551 static assignments for L16 audio.

use crate::sample::{SampleSpec, CHANNEL_MASK_MONO, CHANNEL_MASK_STEREO};

/// L16 stereo at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_STEREO: u8 = 10;

/// L16 mono at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_MONO: u8 = 11;

/// PCM sample layout of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmFormat {
    /// Signed big-endian 16-bit, one channel.
    L16Mono,

    /// Signed big-endian 16-bit, two interleaved channels.
    L16Stereo,
}

impl PcmFormat {
    // ---
    /// Returns the channel mask encoded in the payload.
    pub fn channel_mask(self) -> u32 {
        match self {
            PcmFormat::L16Mono => CHANNEL_MASK_MONO,
            PcmFormat::L16Stereo => CHANNEL_MASK_STEREO,
        }
    }

    /// Returns the number of channels encoded in the payload.
    pub fn num_channels(self) -> usize {
        self.channel_mask().count_ones() as usize
    }

    /// Returns payload bytes for `n_samples` samples per channel.
    pub fn payload_size_from_samples(self, n_samples: usize) -> usize {
        n_samples * self.num_channels() * 2
    }

    /// Returns samples per channel held in `payload_size` bytes.
    pub fn samples_from_payload_size(self, payload_size: usize) -> usize {
        payload_size / self.num_channels() / 2
    }
}

/// One payload type's format description.
#[derive(Debug, Clone, Copy)]
pub struct Format {
    /// RTP payload type number.
    pub payload_type: u8,

    /// Sample spec of the payload stream.
    pub sample_spec: SampleSpec,

    /// PCM layout of the payload bytes.
    pub pcm: PcmFormat,
}

/// Registry of known payload formats.
pub struct FormatMap;

impl FormatMap {
    // ---
    /// Looks up the format for a payload type.
    pub fn format(payload_type: u8) -> Option<Format> {
        // ---
        match payload_type {
            PAYLOAD_TYPE_L16_STEREO => Some(Format {
                payload_type,
                sample_spec: SampleSpec::new(44100, CHANNEL_MASK_STEREO),
                pcm: PcmFormat::L16Stereo,
            }),
            PAYLOAD_TYPE_L16_MONO => Some(Format {
                payload_type,
                sample_spec: SampleSpec::new(44100, CHANNEL_MASK_MONO),
                pcm: PcmFormat::L16Mono,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_known_formats() {
        // ---
        let stereo = FormatMap::format(PAYLOAD_TYPE_L16_STEREO).expect("missing stereo format");
        assert_eq!(stereo.sample_spec.num_channels(), 2);
        assert_eq!(stereo.sample_spec.sample_rate(), 44100);

        let mono = FormatMap::format(PAYLOAD_TYPE_L16_MONO).expect("missing mono format");
        assert_eq!(mono.sample_spec.num_channels(), 1);
    }

    #[test]
    fn test_unknown_format() {
        // ---
        assert!(FormatMap::format(96).is_none());
    }

    #[test]
    fn test_payload_size_roundtrip() {
        // ---
        assert_eq!(PcmFormat::L16Stereo.payload_size_from_samples(160), 640);
        assert_eq!(PcmFormat::L16Stereo.samples_from_payload_size(640), 160);
        assert_eq!(PcmFormat::L16Mono.payload_size_from_samples(160), 320);
    }
}
