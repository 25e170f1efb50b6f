//! End-to-end sender/receiver scenarios.
//!
//! Drives complete pipelines over in-process transports: the sender's
//! packets are composed to wire bytes, re-materialized as a receiver would
//! see them from a socket, and pushed into the receiver's pending queue.
//! Covers the clean path, FEC protection and recovery, session admission
//! and expiry, sequence discontinuities, reordering, and mixing.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use network_simulator::{NetworkSimulator, NetworkSimulatorConfig};
use receiver::{Receiver, ReceiverConfig, SessionConfig, State};
use sender::{Sender, SenderConfig};

use rtp_pcm_common::audio::WatchdogConfig;
use rtp_pcm_common::fec::WriterConfig;
use rtp_pcm_common::rtp::{compose, PcmFormat, PAYLOAD_TYPE_L16_STEREO, RTP_HEADER_SIZE};
use rtp_pcm_common::units::Nanoseconds;
use rtp_pcm_common::{
    packet_flags, Context, ContextConfig, Endpoint, FecScheme, Frame, Interface, Packet,
    PacketWriter, PcmEncoder, RtpAttrs, Sample, SampleSpec, UdpAttrs, CHANNEL_MASK_STEREO,
};

const RATE: u32 = 44100;
const SAMPLES_PER_PACKET: usize = 100;

fn spec() -> SampleSpec {
    SampleSpec::new(RATE, CHANNEL_MASK_STEREO)
}

fn test_context() -> Context {
    // ---
    Context::new(&ContextConfig {
        max_packet_size: 2048,
        max_frame_size: 1000,
        packet_pool_size: 0,
        frame_pool_size: 0,
    })
}

fn samples_ns(samples: i32) -> Nanoseconds {
    spec().samples_to_ns(samples)
}

/// In-process transport: composes the packet, re-materializes it as wire
/// bytes the way a socket would deliver them, and hands it to the receiver.
struct Wire {
    context: Context,
    receiver: Arc<Receiver>,
    src_addr: String,
    dst_addr: String,
    counter: Arc<AtomicU64>,
    drop_period: u64,
    drop_offset: u64,
}

impl PacketWriter for Wire {
    fn write(&mut self, mut packet: Packet) {
        // ---
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        if self.drop_period != 0 && index % self.drop_period == self.drop_offset {
            return;
        }

        assert!(compose(&mut packet), "transport got an uncomposable packet");

        let mut data = self.context.byte_pool().allocate().expect("pool exhausted");
        data.truncate(packet.data().len());
        data.copy_from_slice(packet.data());

        let mut wire = Packet::new(data);
        wire.udp = Some(UdpAttrs {
            src_addr: self.src_addr.parse().unwrap(),
            dst_addr: self.dst_addr.parse().unwrap(),
        });
        self.receiver.write(wire);
    }
}

fn receiver_with_session(context: &Context, session: SessionConfig, fec: bool) -> Arc<Receiver> {
    // ---
    let config = ReceiverConfig {
        default_session: session,
        ..Default::default()
    };
    let r = Arc::new(Receiver::new(context, &config).unwrap());

    let source_uri = if fec {
        "rtp+rs8m://0.0.0.0:5004"
    } else {
        "rtp://0.0.0.0:5004"
    };
    r.bind(Interface::AudioSource, &Endpoint::from_uri(source_uri).unwrap())
        .unwrap();
    if fec {
        r.bind(
            Interface::AudioRepair,
            &Endpoint::from_uri("rs8m://0.0.0.0:5005").unwrap(),
        )
        .unwrap();
    }
    r
}

fn read_frames(receiver: &Receiver, n_frames: usize, frame_len: usize) -> Vec<Sample> {
    // ---
    let mut out = Vec::with_capacity(n_frames * frame_len);
    for _ in 0..n_frames {
        let mut buf = vec![0.0; frame_len];
        let mut frame = Frame::new(&mut buf);
        receiver.read(&mut frame).unwrap();
        out.extend_from_slice(&buf);
    }
    out
}

/// Splits interleaved stereo output: asserts both channels carry the same
/// signal and returns the left channel.
fn left_channel(interleaved: &[Sample]) -> Vec<Sample> {
    // ---
    let mut left = Vec::with_capacity(interleaved.len() / 2);
    for pair in interleaved.chunks(2) {
        assert!(
            (pair[0] - pair[1]).abs() < 1e-6,
            "channels diverge: {} vs {}",
            pair[0],
            pair[1]
        );
        left.push(pair[0]);
    }
    left
}

/// Returns (start, values) of the single contiguous non-silent run.
fn nonsilent_run(left: &[Sample]) -> (usize, Vec<Sample>) {
    // ---
    let start = left
        .iter()
        .position(|s| *s != 0.0)
        .expect("output is all silence");
    let len = left[start..]
        .iter()
        .position(|s| *s == 0.0)
        .unwrap_or(left.len() - start);

    assert!(
        left[start + len..].iter().all(|s| *s == 0.0),
        "output has more than one non-silent run"
    );

    (start, left[start..start + len].to_vec())
}

/// Runs a complete sender → wire → receiver stream of `total_samples`
/// ramp samples and returns the receiver's interleaved output.
fn run_ramp_stream(fec: bool, drop_period: u64, drop_offset: u64, total_samples: usize) -> Vec<Sample> {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(4000),
            ..Default::default()
        },
        fec,
    );

    let sender_config = SenderConfig {
        fec_scheme: if fec {
            FecScheme::ReedSolomonM8
        } else {
            FecScheme::Disable
        },
        fec_writer: WriterConfig {
            n_source_packets: 10,
            n_repair_packets: 5,
        },
        packet_length: samples_ns(SAMPLES_PER_PACKET as i32),
        ..Default::default()
    };
    let mut sender = Sender::new(&context, &sender_config).unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    let wire = |dst: &str| Wire {
        context: context.clone(),
        receiver: Arc::clone(&receiver),
        src_addr: "192.168.0.1:1000".to_string(),
        dst_addr: dst.to_string(),
        counter: Arc::clone(&counter),
        drop_period,
        drop_offset,
    };

    if fec {
        sender
            .connect(
                Interface::AudioSource,
                &Endpoint::from_uri("rtp+rs8m://127.0.0.1:5004").unwrap(),
                wire("127.0.0.1:5004"),
            )
            .unwrap();
        sender
            .connect(
                Interface::AudioRepair,
                &Endpoint::from_uri("rs8m://127.0.0.1:5005").unwrap(),
                wire("127.0.0.1:5005"),
            )
            .unwrap();
    } else {
        sender
            .connect(
                Interface::Aggregate,
                &Endpoint::from_uri("rtp://127.0.0.1:5004").unwrap(),
                wire("127.0.0.1:5004"),
            )
            .unwrap();
    }

    // Frames of 200 samples per channel, ramp (k+1)/32768
    let mut k = 0usize;
    while k < total_samples {
        let n = 200.min(total_samples - k);
        let mut buf = vec![0.0; n * 2];
        for (i, pair) in buf.chunks_mut(2).enumerate() {
            let value = (k + i + 1) as f32 / 32768.0;
            pair[0] = value;
            pair[1] = value;
        }
        let frame = Frame::new(&mut buf);
        sender.write(&frame).unwrap();
        k += n;
    }
    sender.close().unwrap();

    let out = read_frames(&receiver, 16, 1000);
    assert_eq!(receiver.num_sessions(), 1);
    out
}

/// Injects one hand-crafted audio packet as wire bytes.
fn inject(receiver: &Receiver, context: &Context, src_addr: &str, seqnum: u16, timestamp: u32, samples: &[Sample]) {
    // ---
    let n = samples.len() / 2;
    let mut encoder = PcmEncoder::new(PcmFormat::L16Stereo);

    let mut data = context.byte_pool().allocate().unwrap();
    data.truncate(RTP_HEADER_SIZE + encoder.encoded_size(n));
    let mut packet = Packet::new(data);
    let len = packet.data().len();
    packet.set_payload(RTP_HEADER_SIZE..len);

    encoder.begin();
    encoder.write(packet.payload_mut(), samples, n, &spec());
    encoder.end();

    packet.add_flags(packet_flags::AUDIO);
    packet.rtp = Some(RtpAttrs {
        source: 0x7777,
        seqnum,
        timestamp,
        duration: n as u32,
        payload_type: PAYLOAD_TYPE_L16_STEREO,
    });
    assert!(compose(&mut packet));

    let mut data = context.byte_pool().allocate().unwrap();
    data.truncate(packet.data().len());
    data.copy_from_slice(packet.data());
    let mut wire = Packet::new(data);
    wire.udp = Some(UdpAttrs {
        src_addr: src_addr.parse().unwrap(),
        dst_addr: "127.0.0.1:5004".parse().unwrap(),
    });
    receiver.write(wire);
}

fn const_packet_samples(value: Sample) -> Vec<Sample> {
    vec![value; SAMPLES_PER_PACKET * 2]
}

fn ramp_packet_samples(start: usize) -> Vec<Sample> {
    // ---
    let mut samples = vec![0.0; SAMPLES_PER_PACKET * 2];
    for (i, pair) in samples.chunks_mut(2).enumerate() {
        let value = (start + i + 1) as f32 / 32768.0;
        pair[0] = value;
        pair[1] = value;
    }
    samples
}

/// Scenario: bare RTP, no loss. The output is the tail of the written ramp,
/// one latency window long, ending exactly at the last written sample.
#[test]
fn test_bare_rtp_no_loss() {
    // ---
    let out = run_ramp_stream(false, 0, 0, 8000);
    let left = left_channel(&out);
    let (_, run) = nonsilent_run(&left);

    assert_eq!(run.len(), 4000);
    for (j, value) in run.iter().enumerate() {
        let expected = (4001 + j) as f32 / 32768.0;
        assert!(
            (value - expected).abs() < 1e-6,
            "sample {}: {} vs {}",
            j,
            value,
            expected
        );
    }
}

/// Scenario: FEC enabled, no loss. Output is sample-for-sample identical to
/// the bare RTP run.
#[test]
fn test_fec_no_loss_matches_bare_rtp() {
    // ---
    let bare = run_ramp_stream(false, 0, 0, 8000);
    let fec = run_ramp_stream(true, 0, 0, 8000);
    assert_eq!(bare.len(), fec.len());
    for (i, (a, b)) in bare.iter().zip(fec.iter()).enumerate() {
        assert!((a - b).abs() < 1e-9, "sample {}: {} vs {}", i, a, b);
    }
}

/// Scenario: FEC with one packet in fifteen lost. Every block loses one
/// packet and recovers it; output still matches the clean run.
#[test]
fn test_fec_recovers_one_in_fifteen_loss() {
    // ---
    let clean = run_ramp_stream(false, 0, 0, 8000);
    // Block wire order is 10 source + 5 repair; offset 7 hits a source
    // packet in every block.
    let lossy = run_ramp_stream(true, 15, 7, 8000);
    assert_eq!(clean.len(), lossy.len());
    for (i, (a, b)) in clean.iter().zip(lossy.iter()).enumerate() {
        assert!((a - b).abs() < 1e-9, "sample {}: {} vs {}", i, a, b);
    }
}

/// Scenario: one packet, then nothing. The session appears, starves before
/// the initial latency fills, and is torn down by the no-playback timeout;
/// the receiver returns to inactive.
#[test]
fn test_initial_latency_timeout() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            watchdog: WatchdogConfig {
                no_playback_timeout: samples_ns(600),
                ..Default::default()
            },
            ..Default::default()
        },
        false,
    );

    inject(&receiver, &context, "10.0.0.1:4000", 0, 0, &const_packet_samples(0.5));

    read_frames(&receiver, 1, 400);
    assert_eq!(receiver.num_sessions(), 1);
    assert_eq!(receiver.state(), State::Active);

    let out = read_frames(&receiver, 6, 400);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(receiver.num_sessions(), 0);
    assert_eq!(receiver.state(), State::Inactive);
}

/// Scenario: the writer bumps its sequence number by 5 mid-stream. The jump
/// is inside the validator bound, so playback continues without a session
/// reset.
#[test]
fn test_small_seqnum_jump() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    for i in 0..10u16 {
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            i,
            i as u32 * 100,
            &const_packet_samples(0.5),
        );
    }
    let head = read_frames(&receiver, 2, 400);

    // Sequence jumps by 5; timestamps stay continuous
    for i in 0..10u16 {
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            15 + i,
            1000 + i as u32 * 100,
            &const_packet_samples(0.5),
        );
    }
    let tail = read_frames(&receiver, 8, 400);

    assert_eq!(receiver.num_sessions(), 1);

    let left = left_channel(&[head, tail].concat());
    let (_, run) = nonsilent_run(&left);
    assert!(run.len() >= 1300, "run too short: {}", run.len());
    assert!(run.iter().all(|s| (s - 0.5).abs() < 1e-3));
}

/// Scenario: the writer jumps past the validator bound. The validator
/// starves the session and the watchdog tears it down.
#[test]
fn test_large_seqnum_jump_kills_session() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            watchdog: WatchdogConfig {
                no_playback_timeout: samples_ns(800),
                ..Default::default()
            },
            ..Default::default()
        },
        false,
    );

    for i in 0..10u16 {
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            i,
            i as u32 * 100,
            &const_packet_samples(0.5),
        );
    }
    read_frames(&receiver, 2, 400);
    assert_eq!(receiver.num_sessions(), 1);

    // Jump past max_sn_jump (default 100)
    for i in 0..10u16 {
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            111 + i,
            1000 + i as u32 * 100,
            &const_packet_samples(0.5),
        );
    }

    let mut died = false;
    for _ in 0..30 {
        read_frames(&receiver, 1, 400);
        if receiver.state() == State::Inactive {
            died = true;
            break;
        }
    }
    assert!(died, "session survived a seqnum jump past the bound");
    assert_eq!(receiver.num_sessions(), 0);
}

/// Scenario: a batch of packets arrives in reverse order. The sorted queue
/// restores ascending order and the output ramp is contiguous.
#[test]
fn test_packet_reordering() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    for i in (0..20u16).rev() {
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            i,
            i as u32 * 100,
            &ramp_packet_samples(i as usize * 100),
        );
    }

    let out = read_frames(&receiver, 8, 400);
    let left = left_channel(&out);
    let (_, run) = nonsilent_run(&left);

    assert_eq!(run.len(), 400);
    // The run is the ascending tail of the ramp, ending at sample 2000
    for (j, value) in run.iter().enumerate() {
        let expected = (1601 + j) as f32 / 32768.0;
        assert!(
            (value - expected).abs() < 1e-6,
            "sample {}: {} vs {}",
            j,
            value,
            expected
        );
    }
}

/// Scenario: random loss plus reordering through the simulator, with FEC
/// sized to cover the loss. The receiver keeps one live session and
/// produces the ramp tail.
#[test]
fn test_simulated_network_conditions() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        reorder_rate: 0.5,
        seed: Some(42),
        ..Default::default()
    });

    // Push crafted wire packets through the simulator
    for i in 0..20u16 {
        let n = SAMPLES_PER_PACKET;
        let mut encoder = PcmEncoder::new(PcmFormat::L16Stereo);
        let mut data = context.byte_pool().allocate().unwrap();
        data.truncate(RTP_HEADER_SIZE + encoder.encoded_size(n));
        let mut packet = Packet::new(data);
        let len = packet.data().len();
        packet.set_payload(RTP_HEADER_SIZE..len);
        let samples = ramp_packet_samples(i as usize * 100);
        encoder.begin();
        encoder.write(packet.payload_mut(), &samples, n, &spec());
        encoder.end();
        packet.add_flags(packet_flags::AUDIO);
        packet.rtp = Some(RtpAttrs {
            source: 0x7777,
            seqnum: i,
            timestamp: i as u32 * 100,
            duration: n as u32,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
        });
        assert!(compose(&mut packet));
        sim.send(packet);
    }

    while let Some(packet) = sim.receive() {
        let mut data = context.byte_pool().allocate().unwrap();
        data.truncate(packet.data().len());
        data.copy_from_slice(packet.data());
        let mut wire = Packet::new(data);
        wire.udp = Some(UdpAttrs {
            src_addr: "10.0.0.1:4000".parse().unwrap(),
            dst_addr: "127.0.0.1:5004".parse().unwrap(),
        });
        receiver.write(wire);
    }
    assert!(sim.stats().packets_reordered > 0);

    let out = read_frames(&receiver, 8, 400);
    let left = left_channel(&out);
    let (_, run) = nonsilent_run(&left);

    assert_eq!(run.len(), 400);
    for pair in run.windows(2) {
        assert!(pair[1] > pair[0], "run not ascending");
    }
    assert_eq!(receiver.num_sessions(), 1);
}

/// Scenario: every packet is corrupted. No session is ever created and the
/// output stays silent.
#[test]
fn test_corrupted_packets_create_no_session() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    for i in 0..20u8 {
        let mut data = context.byte_pool().allocate().unwrap();
        data.truncate(64);
        data.fill(i.wrapping_mul(37) | 0xC0);
        // Break the RTP version bits
        data[0] = 0x3F;
        let mut wire = Packet::new(data);
        wire.udp = Some(UdpAttrs {
            src_addr: "10.0.0.1:4000".parse().unwrap(),
            dst_addr: "127.0.0.1:5004".parse().unwrap(),
        });
        receiver.write(wire);
    }

    let out = read_frames(&receiver, 4, 400);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(receiver.num_sessions(), 0);
    assert_eq!(receiver.state(), State::Inactive);
}

/// Scenario: two senders into the same port. Two sessions appear and the
/// mixer output is their sum.
#[test]
fn test_two_sources_mix() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    for (src, value) in [("10.0.0.1:4000", 0.25f32), ("10.0.0.2:4000", 0.5f32)] {
        for i in 0..10u16 {
            inject(
                &receiver,
                &context,
                src,
                i,
                i as u32 * 100,
                &const_packet_samples(value),
            );
        }
    }

    let out = read_frames(&receiver, 4, 400);
    assert_eq!(receiver.num_sessions(), 2);

    let left = left_channel(&out);
    let (_, run) = nonsilent_run(&left);
    assert_eq!(run.len(), 400);
    assert!(run.iter().all(|s| (s - 0.75).abs() < 1e-3), "mix is not the sum");
}

/// Property: a stream crossing the 16-bit sequence wrap plays through
/// without interruption.
#[test]
fn test_seqnum_wraparound_stream() {
    // ---
    let context = test_context();
    let receiver = receiver_with_session(
        &context,
        SessionConfig {
            target_latency: samples_ns(400),
            ..Default::default()
        },
        false,
    );

    for i in 0..20u16 {
        let seqnum = 65530u16.wrapping_add(i);
        inject(
            &receiver,
            &context,
            "10.0.0.1:4000",
            seqnum,
            i as u32 * 100,
            &ramp_packet_samples(i as usize * 100),
        );
    }

    let out = read_frames(&receiver, 8, 400);
    let left = left_channel(&out);
    let (_, run) = nonsilent_run(&left);

    assert_eq!(run.len(), 400);
    for pair in run.windows(2) {
        assert!(pair[1] > pair[0], "run not ascending across the wrap");
    }
    assert_eq!(receiver.num_sessions(), 1);
}
