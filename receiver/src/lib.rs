//! Receiver pipeline.
//!
//! Owns the bound ports, the pending-packet queue, the session list, and
//! the mixer. Transport threads enqueue raw packets with `write()`; the
//! processing thread calls `read()`, which admits and routes pending
//! packets, creates and expires sessions, and mixes all session streams
//! into one output frame.
//!
//! Two mutexes split the state: a *control* mutex for ports, pending
//! packets, and the session count, and a *pipeline* mutex for the audio
//! chain. `read()` holds pipeline and briefly takes control inside;
//! `write()` takes control only. Lock order is strictly pipeline, then
//! control.

pub mod network;
mod port;
mod session;

pub use network::UdpReceiver;
pub use port::ReceiverPort;
pub use session::{ReceiverSession, SessionConfig};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use anyhow::{bail, Result};
use tracing::{debug, info};

use rtp_pcm_common::audio::{poison_frame, Mixer, ResamplerProfile};
use rtp_pcm_common::units::Timestamp;
use rtp_pcm_common::{
    frame_flags, packet_flags, ChannelSet, ClockSource, Context, Endpoint, Frame, FrameEncoding,
    FrameReader, Interface, MetricsContext, Packet, Ticker,
};

/// Receiver state visible to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No sessions and no pending packets.
    Inactive,

    /// At least one session or pending packet.
    Active,
}

/// Parameters common to all sessions.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Output sample rate.
    pub output_sample_rate: u32,

    /// Sample format of the frames handed to the caller.
    pub frame_encoding: FrameEncoding,

    /// Output channel layout.
    pub channels: ChannelSet,

    /// Per-session resampling quality; `Disable` requires sessions to
    /// match the output rate.
    pub resampler_profile: ResamplerProfile,

    /// Who paces `read()`.
    pub clock_source: ClockSource,

    /// Render gaps as a diagnostic tone instead of silence.
    pub beeping: bool,

    /// Overwrite frame buffers with a sentinel before filling them.
    pub poisoning: bool,

    /// Defaults for sessions created by this receiver.
    pub default_session: SessionConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        // ---
        Self {
            output_sample_rate: 44100,
            frame_encoding: FrameEncoding::default(),
            channels: ChannelSet::Stereo,
            resampler_profile: ResamplerProfile::Disable,
            clock_source: ClockSource::External,
            beeping: false,
            poisoning: false,
            default_session: SessionConfig::default(),
        }
    }
}

struct Control {
    ports: Vec<ReceiverPort>,
    packets: VecDeque<Packet>,
    num_sessions: usize,
}

struct Pipeline {
    sessions: Vec<ReceiverSession>,
    mixer: Mixer,
    ticker: Ticker,
    timestamp: u64,
}

/// Receiver pipeline head.
pub struct Receiver {
    config: ReceiverConfig,
    context: Context,
    num_channels: usize,
    metrics: Option<MetricsContext>,

    control: Mutex<Control>,
    active_cond: Condvar,
    pipeline: Mutex<Pipeline>,
    closed: AtomicBool,
}

impl Receiver {
    // ---
    /// Creates a receiver pipeline allocating from `context`.
    ///
    /// # Errors
    ///
    /// Returns error when the mixer scratch buffer cannot be allocated.
    pub fn new(context: &Context, config: &ReceiverConfig) -> Result<Self> {
        // ---
        Self::with_metrics(context, config, None)
    }

    /// Creates a receiver that reports into a metrics registry.
    ///
    /// # Errors
    ///
    /// Returns error when the mixer scratch buffer cannot be allocated.
    pub fn with_metrics(
        context: &Context,
        config: &ReceiverConfig,
        metrics: Option<MetricsContext>,
    ) -> Result<Self> {
        // ---
        let mixer = match Mixer::new(context.sample_pool()) {
            Some(mixer) => mixer,
            None => bail!("can't allocate mixer"),
        };

        Ok(Self {
            config: config.clone(),
            context: context.clone(),
            num_channels: config.channels.channel_mask().count_ones() as usize,
            metrics,
            control: Mutex::new(Control {
                ports: Vec::new(),
                packets: VecDeque::new(),
                num_sessions: 0,
            }),
            active_cond: Condvar::new(),
            pipeline: Mutex::new(Pipeline {
                sessions: Vec::new(),
                mixer,
                ticker: Ticker::new(config.output_sample_rate),
                timestamp: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.output_sample_rate
    }

    /// Returns whether `read()` paces itself on the internal clock.
    pub fn has_clock(&self) -> bool {
        self.config.clock_source == ClockSource::Internal
    }

    /// Binds one interface: packets matching the endpoint's port and
    /// parsing under its protocol are admitted.
    ///
    /// A port number of 0 admits any destination port.
    ///
    /// # Errors
    ///
    /// Returns error if the receiver is closed.
    pub fn bind(&self, _interface: Interface, endpoint: &Endpoint) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            bail!("receiver is closed");
        }

        info!("receiver: adding port {}", endpoint.uri());

        let mut control = self.control.lock().unwrap();
        control.ports.push(ReceiverPort::new(endpoint));
        Ok(())
    }

    /// Returns the number of live sessions.
    pub fn num_sessions(&self) -> usize {
        self.control.lock().unwrap().num_sessions
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        state_of(&self.control.lock().unwrap())
    }

    /// Blocks until the receiver becomes active.
    pub fn wait_active(&self) {
        // ---
        let mut control = self.control.lock().unwrap();
        while state_of(&control) != State::Active {
            control = self.active_cond.wait(control).unwrap();
        }
    }

    /// Enqueues one raw packet from a transport thread.
    ///
    /// O(1) under the control lock; wakes `wait_active()` waiters when the
    /// receiver leaves the inactive state.
    pub fn write(&self, packet: Packet) {
        // ---
        let mut control = self.control.lock().unwrap();

        let old_state = state_of(&control);
        control.packets.push_back(packet);

        if old_state != State::Active {
            self.active_cond.notify_all();
        }
    }

    /// Produces one output frame.
    ///
    /// With the internal clock, blocks until the frame's wall-clock slot.
    /// Admits pending packets, updates sessions (tearing down failed
    /// ones), and mixes the survivors.
    ///
    /// # Errors
    ///
    /// Returns error if the receiver is closed.
    ///
    /// # Panics
    ///
    /// Panics if the frame size is not a multiple of the channel count.
    pub fn read(&self, frame: &mut Frame) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            bail!("receiver is closed");
        }

        if frame.len() % self.num_channels != 0 {
            panic!("receiver: unexpected frame size");
        }

        let mut pipeline = self.pipeline.lock().unwrap();

        if self.config.clock_source == ClockSource::Internal {
            let timestamp = pipeline.timestamp;
            pipeline.ticker.wait(timestamp);
        }

        self.prepare(&mut pipeline);

        if self.config.poisoning {
            poison_frame(frame);
        }

        let Pipeline {
            sessions, mixer, ..
        } = &mut *pipeline;

        let mut readers: Vec<&mut dyn FrameReader> = sessions
            .iter_mut()
            .map(|s| s as &mut dyn FrameReader)
            .collect();
        mixer.read(frame, &mut readers);

        if let Some(metrics) = &self.metrics {
            if frame.flags() & frame_flags::INCOMPLETE != 0 {
                metrics.frames_incomplete_total.inc();
            }
        }

        pipeline.timestamp += (frame.len() / self.num_channels) as u64;
        Ok(())
    }

    /// Closes the receiver. The caller must ensure no concurrent reads or
    /// writes remain in flight.
    ///
    /// # Errors
    ///
    /// Returns error if the receiver is already closed.
    pub fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            bail!("receiver is already closed");
        }

        let mut pipeline = self.pipeline.lock().unwrap();
        let mut control = self.control.lock().unwrap();

        debug!(
            "receiver: closing: sessions={} pending={}",
            pipeline.sessions.len(),
            control.packets.len()
        );

        pipeline.sessions.clear();
        control.packets.clear();
        control.num_sessions = 0;
        Ok(())
    }

    fn prepare(&self, pipeline: &mut Pipeline) {
        // ---
        let mut control = self.control.lock().unwrap();

        let old_state = state_of(&control);

        self.fetch_packets(&mut control, pipeline);
        self.update_sessions(pipeline);

        control.num_sessions = pipeline.sessions.len();

        if old_state != State::Active && state_of(&control) == State::Active {
            self.active_cond.notify_all();
        }
    }

    fn fetch_packets(&self, control: &mut Control, pipeline: &mut Pipeline) {
        // ---
        while let Some(mut packet) = control.packets.pop_front() {
            if !control.ports.iter().any(|port| port.handle(&mut packet)) {
                debug!("receiver: ignoring packet for unknown port");
                if let Some(metrics) = &self.metrics {
                    metrics.packets_dropped_total.inc();
                }
                continue;
            }

            if let Some(metrics) = &self.metrics {
                metrics.packets_received_total.inc();
            }

            self.route_packet(pipeline, packet);
        }
    }

    fn route_packet(&self, pipeline: &mut Pipeline, packet: Packet) {
        // ---
        let packet = packet.into_shared();

        for session in pipeline.sessions.iter_mut() {
            if session.handle(&packet) {
                return;
            }
        }

        if packet.has_flags(packet_flags::REPAIR) {
            debug!("receiver: ignoring repair packet for unknown session");
            return;
        }

        let udp = match &packet.udp {
            Some(udp) => udp,
            None => {
                debug!("receiver: can't create session, packet has no udp addresses");
                return;
            }
        };
        let rtp = match &packet.rtp {
            Some(rtp) => rtp,
            None => {
                debug!("receiver: can't create session, packet has no rtp fields");
                return;
            }
        };

        let fec_params = packet.fec.as_ref().map(|fec| {
            (
                fec.scheme,
                fec.source_block_len as usize,
                fec.repair_block_len as usize,
            )
        });

        info!(
            "receiver: creating session: src_addr={} dst_addr={}",
            udp.src_addr, udp.dst_addr
        );

        let session = ReceiverSession::new(
            &self.config.default_session,
            udp.src_addr,
            rtp.payload_type,
            fec_params,
            self.config.output_sample_rate,
            self.config.channels.channel_mask(),
            self.config.resampler_profile,
            self.config.beeping,
            self.config.poisoning,
            &self.context,
        );

        let mut session = match session {
            Some(session) => session,
            None => {
                debug!("receiver: can't create session, initialization failed");
                return;
            }
        };

        if !session.handle(&packet) {
            debug!("receiver: can't create session, can't handle first packet");
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.sessions_created_total.inc();
        }
        pipeline.sessions.push(session);
    }

    fn update_sessions(&self, pipeline: &mut Pipeline) {
        // ---
        let pos = pipeline.timestamp as Timestamp;

        let metrics = self.metrics.as_ref();
        pipeline.sessions.retain_mut(|session| {
            let alive = session.update(pos);
            if !alive {
                info!("receiver: removing session: src_addr={}", session.src_addr());
                if let Some(metrics) = metrics {
                    metrics.sessions_removed_total.inc();
                    metrics
                        .packets_recovered_total
                        .inc_by(session.recovered_packets());
                }
            }
            alive
        });

        if let Some(metrics) = metrics {
            metrics.sessions_active.set(pipeline.sessions.len() as i64);
        }
    }
}

fn state_of(control: &Control) -> State {
    // ---
    if control.num_sessions != 0 || !control.packets.is_empty() {
        State::Active
    } else {
        State::Inactive
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rtp_pcm_common::BufferPool;

    fn receiver() -> Receiver {
        let context = Context::default();
        Receiver::new(&context, &ReceiverConfig::default()).unwrap()
    }

    fn raw_packet() -> Packet {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut data = pool.allocate().unwrap();
        data.truncate(20);
        Packet::new(data)
    }

    #[test]
    fn test_starts_inactive() {
        // ---
        let r = receiver();
        assert_eq!(r.state(), State::Inactive);
        assert_eq!(r.num_sessions(), 0);
    }

    #[test]
    fn test_pending_packet_activates() {
        // ---
        let r = receiver();
        r.write(raw_packet());
        assert_eq!(r.state(), State::Active);
    }

    #[test]
    fn test_unknown_port_packet_dropped_on_read() {
        // ---
        let r = receiver();
        r.write(raw_packet());

        let mut buf = vec![0.0; 64];
        let mut frame = Frame::new(&mut buf);
        r.read(&mut frame).unwrap();

        // No port claims the packet: back to inactive, no session
        assert_eq!(r.state(), State::Inactive);
        assert_eq!(r.num_sessions(), 0);
    }

    #[test]
    fn test_read_without_packets_produces_silence() {
        // ---
        let r = receiver();

        let mut buf = vec![1.0; 64];
        let mut frame = Frame::new(&mut buf);
        r.read(&mut frame).unwrap();
        assert!(buf.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_close_is_single_shot() {
        // ---
        let r = receiver();
        r.close().unwrap();
        assert!(r.close().is_err());

        let mut buf = vec![0.0; 64];
        let mut frame = Frame::new(&mut buf);
        assert!(r.read(&mut frame).is_err());
        assert!(r.bind(Interface::Aggregate, &Endpoint::from_uri("rtp://0.0.0.0:0").unwrap()).is_err());
    }

    #[test]
    fn test_wait_active_wakes_on_write() {
        // ---
        use std::sync::Arc;

        let r = Arc::new(receiver());
        let waiter = {
            let r = Arc::clone(&r);
            std::thread::spawn(move || r.wait_active())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        r.write(raw_packet());
        waiter.join().unwrap();
    }
}
