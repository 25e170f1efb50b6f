//! RTP wire format, payload formats, and stream validation.

mod format;
mod validator;
mod wire;

pub use format::{Format, FormatMap, PcmFormat, PAYLOAD_TYPE_L16_MONO, PAYLOAD_TYPE_L16_STEREO};
pub use validator::{RtpValidator, ValidatorConfig};
pub use wire::{compose, parse, FEC_FOOTER_SIZE, RTP_HEADER_SIZE};
