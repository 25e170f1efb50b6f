//! Sender pipeline.
//!
//! Assembles the outgoing chain (optional resampling, packetization,
//! optional FEC encoding and interleaving, routing to the connected
//! transports) and drives it from `write()`. With the internal clock the
//! writer thread is paced to the stream's sample rate.

pub mod network;

pub use network::{UdpLink, UdpSender};

use anyhow::{bail, Context as AnyhowContext, Result};
use tracing::{debug, info};

use rtp_pcm_common::audio::{
    Packetizer, ResamplerConfig, ResamplerProfile, ResamplerWriter,
};
use rtp_pcm_common::fec::{FecWriter, WriterConfig};
use rtp_pcm_common::rtp::{FormatMap, FEC_FOOTER_SIZE, PAYLOAD_TYPE_L16_STEREO};
use rtp_pcm_common::units::{Nanoseconds, MILLISECOND};
use rtp_pcm_common::{
    packet_flags, ChannelSet, ClockSource, Context, Endpoint, FecScheme, Frame, FrameEncoding,
    FrameWriter, Interface, Interleaver, Packet, PacketWriter, Router, SampleSpec, Ticker,
};

/// Sender parameters.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// FEC scheme protecting the stream.
    pub fec_scheme: FecScheme,

    /// FEC block layout.
    pub fec_writer: WriterConfig,

    /// Sample rate of the frames written by the caller.
    pub input_sample_rate: u32,

    /// Sample format of the frames written by the caller.
    pub frame_encoding: FrameEncoding,

    /// Channel layout of the frames written by the caller.
    pub channels: ChannelSet,

    /// Duration of one packet.
    pub packet_length: Nanoseconds,

    /// RTP payload type for audio packets.
    pub payload_type: u8,

    /// Resampler quality used when the input rate differs from the wire
    /// rate.
    pub resampler_profile: ResamplerProfile,

    /// Permute packets inside each FEC block before sending.
    pub interleaving: bool,

    /// Who paces `write()`.
    pub clock_source: ClockSource,
}

impl Default for SenderConfig {
    fn default() -> Self {
        // ---
        Self {
            fec_scheme: FecScheme::Disable,
            fec_writer: WriterConfig::default(),
            input_sample_rate: 44100,
            frame_encoding: FrameEncoding::default(),
            channels: ChannelSet::Stereo,
            packet_length: 7 * MILLISECOND,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            resampler_profile: ResamplerProfile::Disable,
            interleaving: false,
            clock_source: ClockSource::External,
        }
    }
}

/// Sender pipeline head.
pub struct Sender {
    packetizer: Packetizer,
    fec: Option<FecWriter>,
    interleaver: Option<Interleaver>,
    router: Router<Packet>,
    resampler: Option<ResamplerWriter>,
    ticker: Option<Ticker>,

    fec_scheme: FecScheme,
    input_sample_rate: u32,
    num_channels: usize,
    timestamp: u64,

    source_connected: bool,
    repair_connected: bool,
    closed: bool,
}

impl Sender {
    // ---
    /// Creates a sender pipeline allocating from `context`.
    ///
    /// # Errors
    ///
    /// Returns error on an unknown payload type, an unsupported FEC
    /// scheme, or a rate mismatch with resampling disabled.
    pub fn new(context: &Context, config: &SenderConfig) -> Result<Self> {
        // ---
        let format = FormatMap::format(config.payload_type)
            .with_context(|| format!("unknown payload type: {}", config.payload_type))?;

        let input_spec = SampleSpec::new(config.input_sample_rate, config.channels.channel_mask());

        let trailer_size = if config.fec_scheme == FecScheme::Disable {
            0
        } else {
            FEC_FOOTER_SIZE
        };

        let packetizer = Packetizer::new(
            format,
            SampleSpec::new(format.sample_spec.sample_rate(), input_spec.channel_mask()),
            config.packet_length,
            trailer_size,
            context.byte_pool().clone(),
        );

        let fec = match config.fec_scheme {
            FecScheme::Disable => None,
            scheme => Some(
                FecWriter::new(&config.fec_writer, scheme, context.byte_pool().clone())
                    .with_context(|| format!("no codec for fec scheme {:?}", scheme))?,
            ),
        };

        let interleaver = if config.interleaving && fec.is_some() {
            Some(Interleaver::new(
                config.fec_writer.n_source_packets + config.fec_writer.n_repair_packets,
            ))
        } else {
            None
        };

        let resampler = if config.input_sample_rate != format.sample_spec.sample_rate() {
            if config.resampler_profile == ResamplerProfile::Disable {
                bail!(
                    "input rate {} does not match wire rate {} and resampling is disabled",
                    config.input_sample_rate,
                    format.sample_spec.sample_rate()
                );
            }

            let mut resampler = ResamplerWriter::new(
                &ResamplerConfig::from_profile(config.resampler_profile),
                input_spec,
                context.sample_pool(),
            )
            .context("can't create resampler")?;

            let scaling =
                format.sample_spec.sample_rate() as f32 / config.input_sample_rate as f32;
            if !resampler.set_scaling(scaling) {
                bail!("resampler scaling out of bounds: {}", scaling);
            }

            Some(resampler)
        } else {
            None
        };

        let ticker = match config.clock_source {
            ClockSource::Internal => Some(Ticker::new(config.input_sample_rate)),
            ClockSource::External => None,
        };

        Ok(Self {
            packetizer,
            fec,
            interleaver,
            router: Router::new(),
            resampler,
            ticker,
            fec_scheme: config.fec_scheme,
            input_sample_rate: config.input_sample_rate,
            num_channels: input_spec.num_channels(),
            timestamp: 0,
            source_connected: false,
            repair_connected: false,
            closed: false,
        })
    }

    /// Returns the sample rate of frames the caller writes.
    pub fn sample_rate(&self) -> u32 {
        self.input_sample_rate
    }

    /// Returns whether `write()` paces itself on the internal clock.
    pub fn has_clock(&self) -> bool {
        self.ticker.is_some()
    }

    /// Connects one interface to a remote endpoint, attaching the transport
    /// that will carry its packets.
    ///
    /// # Errors
    ///
    /// Returns error when the endpoint protocol does not agree with the
    /// configured FEC scheme or the interface, or on double connect.
    pub fn connect(
        &mut self,
        interface: Interface,
        endpoint: &Endpoint,
        transport: impl PacketWriter + 'static,
    ) -> Result<()> {
        // ---
        if self.closed {
            bail!("sender is closed");
        }

        if endpoint.protocol.fec_scheme() != self.fec_scheme {
            bail!(
                "endpoint {} does not match fec scheme {:?}",
                endpoint.uri(),
                self.fec_scheme
            );
        }

        match interface {
            Interface::Aggregate | Interface::AudioSource => {
                if endpoint.protocol.is_repair() {
                    bail!("source interface requires a source protocol: {}", endpoint.uri());
                }
                if self.source_connected {
                    bail!("source interface already connected");
                }
                self.router.add_route(packet_flags::AUDIO, writer_route(transport));
                self.source_connected = true;
            }
            Interface::AudioRepair => {
                if self.fec_scheme == FecScheme::Disable {
                    bail!("repair interface requires fec");
                }
                if !endpoint.protocol.is_repair() {
                    bail!("repair interface requires a repair protocol: {}", endpoint.uri());
                }
                if self.repair_connected {
                    bail!("repair interface already connected");
                }
                self.router.add_route(packet_flags::REPAIR, writer_route(transport));
                self.repair_connected = true;
            }
        }

        info!("sender: connected {:?} to {}", interface, endpoint.uri());
        Ok(())
    }

    /// Returns whether all interfaces required by the configuration are
    /// connected.
    pub fn is_ready(&self) -> bool {
        // ---
        self.source_connected && (self.fec_scheme == FecScheme::Disable || self.repair_connected)
    }

    /// Pushes one frame down the chain.
    ///
    /// With the internal clock, blocks until the frame's wall-clock slot.
    ///
    /// # Errors
    ///
    /// Returns error if the sender is closed or not fully connected.
    ///
    /// # Panics
    ///
    /// Panics if the frame size is not a multiple of the channel count.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        // ---
        if self.closed {
            bail!("sender is closed");
        }
        if !self.is_ready() {
            bail!("sender is not connected");
        }

        if frame.len() % self.num_channels != 0 {
            panic!("sender: unexpected frame size");
        }

        if let Some(ticker) = &mut self.ticker {
            ticker.wait(self.timestamp);
        }

        let Self {
            packetizer,
            fec,
            interleaver,
            router,
            resampler,
            ..
        } = self;

        let mut sink = FrameSink {
            packetizer,
            chain: PacketChain {
                fec: fec.as_mut(),
                interleaver: interleaver.as_mut(),
                router,
            },
        };

        match resampler {
            Some(resampler) => resampler.write(frame, &mut sink),
            None => sink.write(frame),
        }

        self.timestamp += (frame.len() / self.num_channels) as u64;
        Ok(())
    }

    /// Flushes the in-progress packet and closes the sender.
    ///
    /// # Errors
    ///
    /// Returns error if the sender is already closed.
    pub fn close(&mut self) -> Result<()> {
        // ---
        if self.closed {
            bail!("sender is already closed");
        }

        debug!("sender: closing: timestamp={}", self.timestamp);

        let Self {
            packetizer,
            fec,
            interleaver,
            router,
            ..
        } = self;

        let mut chain = PacketChain {
            fec: fec.as_mut(),
            interleaver: interleaver.as_mut(),
            router: &mut *router,
        };
        packetizer.flush(&mut chain);

        if let Some(interleaver) = interleaver {
            interleaver.flush(&mut RouterSink(router));
        }

        self.closed = true;
        Ok(())
    }
}

fn writer_route(mut transport: impl PacketWriter + 'static) -> impl FnMut(Packet) + Send + 'static {
    move |packet| transport.write(packet)
}

/// Packet path below the packetizer: FEC, interleaver, router.
struct PacketChain<'a> {
    fec: Option<&'a mut FecWriter>,
    interleaver: Option<&'a mut Interleaver>,
    router: &'a mut Router<Packet>,
}

impl PacketWriter for PacketChain<'_> {
    fn write(&mut self, packet: Packet) {
        // ---
        match &mut self.fec {
            Some(fec) => {
                let mut down = PostFec {
                    interleaver: self.interleaver.as_deref_mut(),
                    router: &mut *self.router,
                };
                fec.write(packet, &mut down);
            }
            None => {
                let mut down = PostFec {
                    interleaver: self.interleaver.as_deref_mut(),
                    router: &mut *self.router,
                };
                down.write(packet);
            }
        }
    }
}

struct PostFec<'a> {
    interleaver: Option<&'a mut Interleaver>,
    router: &'a mut Router<Packet>,
}

impl PacketWriter for PostFec<'_> {
    fn write(&mut self, packet: Packet) {
        // ---
        match &mut self.interleaver {
            Some(interleaver) => interleaver.write(packet, &mut RouterSink(self.router)),
            None => self.router.write(packet),
        }
    }
}

struct RouterSink<'a>(&'a mut Router<Packet>);

impl PacketWriter for RouterSink<'_> {
    fn write(&mut self, packet: Packet) {
        self.0.write(packet);
    }
}

/// Frame entry point: packetizes into the packet chain.
struct FrameSink<'a> {
    packetizer: &'a mut Packetizer,
    chain: PacketChain<'a>,
}

impl FrameWriter for FrameSink<'_> {
    fn write(&mut self, frame: &Frame) {
        self.packetizer.write(frame, &mut self.chain);
    }
}
