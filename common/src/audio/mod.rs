//! Audio-side chain stages: packetization, playout, mixing, supervision.

mod depacketizer;
mod latency;
mod mixer;
mod packetizer;
mod poison;
mod resampler;
mod watchdog;

pub use depacketizer::Depacketizer;
pub use latency::{FreqEstimator, LatencyMonitor, LatencyMonitorConfig};
pub use mixer::Mixer;
pub use packetizer::Packetizer;
pub use poison::{poison_frame, PoisonReader};
pub use resampler::{
    Resampler, ResamplerConfig, ResamplerProfile, ResamplerReader, ResamplerWriter,
};
pub use watchdog::{Watchdog, WatchdogConfig};
