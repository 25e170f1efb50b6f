//! Shared pipeline core used by the sender and receiver crates.
//!
//! This crate is the **public gateway** for everything both pipelines
//! share: the packet and frame model, wrap-aware units, pools, queues and
//! routing, the RTP wire format and validator, the PCM payload codec, FEC
//! blocks, the adaptive resampler, and the supervision components (latency
//! monitor, watchdog). Downstream crates should import through the re-exports
//! and not drill into internal module structure.

pub mod audio;
mod context;
mod delayed;
mod endpoint;
pub mod fec;
mod frame;
mod interleaver;
mod observability;
mod packet;
mod pcm;
mod pool;
mod queue;
mod router;
pub mod rtp;
mod sample;
mod ticker;
pub mod units;

pub use context::{Context, ContextConfig};
pub use delayed::DelayedReader;
pub use endpoint::{Endpoint, Interface, Protocol};
pub use frame::{flags as frame_flags, Frame, FrameReader, FrameWriter};
pub use interleaver::Interleaver;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use packet::{
    flags as packet_flags, FecAttrs, FecScheme, Packet, PacketPtr, PacketReader, PacketWriter,
    RtpAttrs, UdpAttrs,
};
pub use pcm::{PcmDecoder, PcmEncoder};
pub use pool::{BufferPool, PooledBuffer};
pub use queue::{OrderBy, SortedQueue};
pub use router::{Routable, Router};
pub use sample::{
    ChannelMask, ChannelSet, FrameEncoding, Sample, SampleSpec, CHANNEL_MASK_MONO,
    CHANNEL_MASK_STEREO,
};
pub use ticker::{ClockSource, Ticker};
