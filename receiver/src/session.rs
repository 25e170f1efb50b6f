//! Receiver session.
//!
//! Per-remote-sender state: the packet chain (queues, initial-latency
//! cushion, validation, FEC recovery) feeding a depacketizer, supervised by
//! a watchdog and a latency monitor, optionally resampled to the output
//! rate. Sessions are created lazily by the receiver on the first admitted
//! audio packet and torn down when supervision reports failure.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use rtp_pcm_common::audio::{
    poison_frame, Depacketizer, LatencyMonitor, LatencyMonitorConfig, ResamplerConfig,
    ResamplerProfile, ResamplerReader, Watchdog, WatchdogConfig,
};
use rtp_pcm_common::fec::{FecReader, ReaderConfig};
use rtp_pcm_common::rtp::{FormatMap, RtpValidator, ValidatorConfig};
use rtp_pcm_common::units::{Nanoseconds, Timestamp, MILLISECOND};
use rtp_pcm_common::{
    packet_flags, ChannelMask, Context, DelayedReader, FecScheme, Frame, FrameReader, OrderBy,
    PacketPtr, PacketReader, PcmDecoder, Router, SampleSpec, SortedQueue,
};

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial latency cushion and latency-control target.
    pub target_latency: Nanoseconds,

    /// Latency monitor tuning.
    pub latency_monitor: LatencyMonitorConfig,

    /// Watchdog timeouts.
    pub watchdog: WatchdogConfig,

    /// RTP validator bounds.
    pub validator: ValidatorConfig,

    /// FEC reader tuning.
    pub fec_reader: ReaderConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // ---
        Self {
            target_latency: 200 * MILLISECOND,
            latency_monitor: LatencyMonitorConfig::default(),
            watchdog: WatchdogConfig::default(),
            validator: ValidatorConfig::default(),
            fec_reader: ReaderConfig::default(),
        }
    }
}

struct FecChain {
    reader: FecReader,
    validator: RtpValidator,
}

/// One remote sender's receiving state.
pub struct ReceiverSession {
    src_addr: SocketAddr,

    router: Router<PacketPtr>,
    source_queue: Arc<Mutex<SortedQueue>>,
    repair_queue: Option<Arc<Mutex<SortedQueue>>>,

    delayed: DelayedReader,
    validator: RtpValidator,
    fec: Option<FecChain>,

    depacketizer: Depacketizer,
    watchdog: Option<Watchdog>,
    resampler: Option<ResamplerReader>,
    latency: LatencyMonitor,

    poisoning: bool,
}

impl ReceiverSession {
    // ---
    /// Creates the session chain for a source at `src_addr` whose first
    /// packet carried `payload_type` and, if FEC-protected, the given
    /// scheme and block layout.
    ///
    /// Returns `None` when any stage fails to construct; the caller logs
    /// and refuses the session.
    pub fn new(
        config: &SessionConfig,
        src_addr: SocketAddr,
        payload_type: u8,
        fec_params: Option<(FecScheme, usize, usize)>,
        output_sample_rate: u32,
        output_channel_mask: ChannelMask,
        resampler_profile: ResamplerProfile,
        beeping: bool,
        poisoning: bool,
        context: &Context,
    ) -> Option<Self> {
        // ---
        let format = FormatMap::format(payload_type)?;

        let source_queue = Arc::new(Mutex::new(SortedQueue::new(OrderBy::Seqnum, 0)));

        let mut router = Router::new();
        {
            let queue = Arc::clone(&source_queue);
            router.add_route(packet_flags::AUDIO, move |packet: PacketPtr| {
                queue.lock().unwrap().write(packet);
            });
        }

        let delayed = DelayedReader::new(config.target_latency, format.sample_spec);
        let validator = RtpValidator::new(config.validator.clone(), format.sample_spec);

        let (repair_queue, fec) = match fec_params {
            Some((scheme, n_source, n_repair)) => {
                let repair_queue = Arc::new(Mutex::new(SortedQueue::new(OrderBy::FecBlock, 0)));
                {
                    let queue = Arc::clone(&repair_queue);
                    router.add_route(packet_flags::REPAIR, move |packet: PacketPtr| {
                        queue.lock().unwrap().write(packet);
                    });
                }

                let reader = FecReader::new(
                    &config.fec_reader,
                    scheme,
                    n_source,
                    n_repair,
                    context.byte_pool().clone(),
                )?;
                let fec_validator =
                    RtpValidator::new(config.validator.clone(), format.sample_spec);

                (
                    Some(repair_queue),
                    Some(FecChain {
                        reader,
                        validator: fec_validator,
                    }),
                )
            }
            None => (None, None),
        };

        let session_spec =
            SampleSpec::new(format.sample_spec.sample_rate(), output_channel_mask);
        let depacketizer =
            Depacketizer::new(PcmDecoder::new(format.pcm), session_spec, beeping);

        let watchdog = if config.watchdog.no_playback_timeout != 0
            || config.watchdog.broken_playback_timeout != 0
            || config.watchdog.frame_status_window != 0
        {
            Some(Watchdog::new(
                &config.watchdog,
                SampleSpec::new(output_sample_rate, output_channel_mask),
            )?)
        } else {
            None
        };

        let mut resampler = if resampler_profile != ResamplerProfile::Disable {
            Some(ResamplerReader::new(
                &ResamplerConfig::from_profile(resampler_profile),
                session_spec,
                context.sample_pool(),
            )?)
        } else {
            None
        };

        let latency = LatencyMonitor::new(
            &config.latency_monitor,
            config.target_latency,
            format.sample_spec,
            SampleSpec::new(output_sample_rate, output_channel_mask),
            resampler.as_mut(),
        )?;

        info!("session: created: src_addr={}", src_addr);

        Some(Self {
            src_addr,
            router,
            source_queue,
            repair_queue,
            delayed,
            validator,
            fec,
            depacketizer,
            watchdog,
            resampler,
            latency,
            poisoning,
        })
    }

    /// Returns the remote address identifying the session.
    pub fn src_addr(&self) -> SocketAddr {
        self.src_addr
    }

    /// Returns how many packets FEC reconstructed for this session.
    pub fn recovered_packets(&self) -> u64 {
        // ---
        self.fec.as_ref().map_or(0, |fec| fec.reader.recovered_total())
    }

    /// Routes a packet into the session if its source address matches.
    pub fn handle(&mut self, packet: &PacketPtr) -> bool {
        // ---
        let udp = match &packet.udp {
            Some(udp) => udp,
            None => return false,
        };

        if udp.src_addr != self.src_addr {
            return false;
        }

        self.router.write(packet.clone());
        true
    }

    /// Runs one supervision tick at playout position `pos`.
    ///
    /// Returns `false` when the session must be torn down.
    pub fn update(&mut self, pos: Timestamp) -> bool {
        // ---
        if let Some(watchdog) = &mut self.watchdog {
            if !watchdog.update() {
                return false;
            }
        }

        if let Some(fec) = &self.fec {
            if !fec.reader.is_alive() {
                debug!("session: fec chain broken: src_addr={}", self.src_addr);
                return false;
            }
        }

        let queue = self.source_queue.lock().unwrap();
        self.latency
            .update(pos, &queue, &self.depacketizer, self.resampler.as_mut())
    }
}

impl FrameReader for ReceiverSession {
    fn read(&mut self, frame: &mut Frame) {
        // ---
        if self.poisoning {
            poison_frame(frame);
        }

        let Self {
            source_queue,
            repair_queue,
            delayed,
            validator,
            fec,
            depacketizer,
            watchdog,
            resampler,
            ..
        } = self;

        let mut source = SupervisedSource {
            watchdog: watchdog.as_mut(),
            inner: DepacketizerSource {
                depacketizer,
                feed: PacketFeed {
                    source_queue: &**source_queue,
                    repair_queue: repair_queue.as_deref(),
                    delayed,
                    validator,
                    fec: fec.as_mut(),
                },
            },
        };

        match resampler {
            Some(resampler) => resampler.read(frame, &mut source),
            None => source.read(frame),
        }
    }
}

// Per-call composition of the packet chain: the stages are plain session
// fields, borrowed into lightweight adapters for the duration of one read.

struct SharedQueueReader<'a>(&'a Mutex<SortedQueue>);

impl PacketReader for SharedQueueReader<'_> {
    fn read(&mut self) -> Option<PacketPtr> {
        self.0.lock().unwrap().pop()
    }
}

struct DelayedStage<'a> {
    delayed: &'a mut DelayedReader,
    upstream: SharedQueueReader<'a>,
}

impl PacketReader for DelayedStage<'_> {
    fn read(&mut self) -> Option<PacketPtr> {
        self.delayed.read(&mut self.upstream)
    }
}

struct ValidatorStage<'a, R: PacketReader> {
    validator: &'a mut RtpValidator,
    upstream: R,
}

impl<R: PacketReader> PacketReader for ValidatorStage<'_, R> {
    fn read(&mut self) -> Option<PacketPtr> {
        self.validator.read(&mut self.upstream)
    }
}

struct FecStage<'a, R: PacketReader> {
    reader: &'a mut FecReader,
    source: R,
    repair: SharedQueueReader<'a>,
}

impl<R: PacketReader> PacketReader for FecStage<'_, R> {
    fn read(&mut self) -> Option<PacketPtr> {
        self.reader.read(&mut self.source, &mut self.repair)
    }
}

struct PacketFeed<'a> {
    source_queue: &'a Mutex<SortedQueue>,
    repair_queue: Option<&'a Mutex<SortedQueue>>,
    delayed: &'a mut DelayedReader,
    validator: &'a mut RtpValidator,
    fec: Option<&'a mut FecChain>,
}

impl PacketReader for PacketFeed<'_> {
    fn read(&mut self) -> Option<PacketPtr> {
        // ---
        let base = ValidatorStage {
            validator: &mut *self.validator,
            upstream: DelayedStage {
                delayed: &mut *self.delayed,
                upstream: SharedQueueReader(self.source_queue),
            },
        };

        match (&mut self.fec, self.repair_queue) {
            (Some(fec), Some(repair_queue)) => {
                let mut chain = ValidatorStage {
                    validator: &mut fec.validator,
                    upstream: FecStage {
                        reader: &mut fec.reader,
                        source: base,
                        repair: SharedQueueReader(repair_queue),
                    },
                };
                chain.read()
            }
            _ => {
                let mut base = base;
                base.read()
            }
        }
    }
}

struct DepacketizerSource<'a> {
    depacketizer: &'a mut Depacketizer,
    feed: PacketFeed<'a>,
}

impl FrameReader for DepacketizerSource<'_> {
    fn read(&mut self, frame: &mut Frame) {
        self.depacketizer.read(frame, &mut self.feed);
    }
}

struct SupervisedSource<'a> {
    watchdog: Option<&'a mut Watchdog>,
    inner: DepacketizerSource<'a>,
}

impl FrameReader for SupervisedSource<'_> {
    fn read(&mut self, frame: &mut Frame) {
        // ---
        match &mut self.watchdog {
            Some(watchdog) => watchdog.read(frame, &mut self.inner),
            None => self.inner.read(frame),
        }
    }
}
