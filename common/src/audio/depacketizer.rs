//! Depacketizer.
//!
//! Turns the per-session packet stream back into a gapless frame stream.
//! Tracks a monotonic playout timestamp: holes in the packet stream are
//! rendered as silence (or a diagnostic beep), late packets are dropped,
//! and packets are decoded partially when they straddle frame boundaries.

use tracing::debug;

use crate::frame::{flags, Frame};
use crate::packet::{PacketPtr, PacketReader};
use crate::pcm::PcmDecoder;
use crate::sample::{Sample, SampleSpec};
use crate::units::{timestamp_diff, timestamp_lt, Timestamp};

fn write_zeros(buf: &mut [Sample]) {
    buf.fill(0.0);
}

fn write_beep(buf: &mut [Sample]) {
    // ---
    for (n, sample) in buf.iter_mut().enumerate() {
        *sample = (2.0 * std::f32::consts::PI / 44100.0 * 880.0 * n as f32).sin();
    }
}

/// Frame reader assembling decoded packets into a continuous stream.
pub struct Depacketizer {
    decoder: PcmDecoder,
    sample_spec: SampleSpec,
    beep: bool,

    packet: Option<PacketPtr>,
    timestamp: Timestamp,
    first_packet: bool,

    zero_samples: u64,
    missing_samples: u64,
    packet_samples: u64,
    dropped_packets: u64,
}

impl Depacketizer {
    // ---
    /// Creates a depacketizer decoding payloads with `decoder`.
    ///
    /// With `beep` set, gap samples carry an 880 Hz tone instead of silence.
    pub fn new(decoder: PcmDecoder, sample_spec: SampleSpec, beep: bool) -> Self {
        // ---
        debug!(
            "depacketizer: initializing: n_channels={}",
            sample_spec.num_channels()
        );

        Self {
            decoder,
            sample_spec,
            beep,
            packet: None,
            timestamp: 0,
            first_packet: true,
            zero_samples: 0,
            missing_samples: 0,
            packet_samples: 0,
            dropped_packets: 0,
        }
    }

    /// Returns whether the first packet was seen.
    pub fn started(&self) -> bool {
        !self.first_packet
    }

    /// Returns the playout timestamp: the stream position of the next
    /// sample to be produced. Zero before the stream started.
    pub fn timestamp(&self) -> Timestamp {
        // ---
        if self.first_packet {
            return 0;
        }
        self.timestamp
    }

    /// Returns how many silence samples were inserted for lost packets.
    pub fn missing_samples(&self) -> u64 {
        self.missing_samples
    }

    /// Fills one frame from the packet stream, setting its status flags.
    ///
    /// # Panics
    ///
    /// Panics if the frame size is not a multiple of the channel count.
    pub fn read(&mut self, frame: &mut Frame, upstream: &mut dyn PacketReader) {
        // ---
        let prev_dropped = self.dropped_packets;
        let prev_packet_samples = self.packet_samples;

        if frame.len() % self.sample_spec.num_channels() != 0 {
            panic!("depacketizer: unexpected frame size");
        }

        let mut pos = 0;
        while pos < frame.len() {
            pos = self.read_samples(frame, pos, upstream);
        }

        self.set_frame_flags(frame, prev_dropped, prev_packet_samples);
    }

    fn read_samples(&mut self, frame: &mut Frame, pos: usize, upstream: &mut dyn PacketReader) -> usize {
        // ---
        let num_channels = self.sample_spec.num_channels();

        self.update_packet(upstream);

        if self.packet.is_none() {
            return self.read_missing_samples(frame, pos, frame.len());
        }

        let mut pos = pos;

        let next_timestamp = self.decoder.position();
        if self.timestamp != next_timestamp {
            debug_assert!(timestamp_lt(self.timestamp, next_timestamp));

            let mis_samples =
                num_channels * timestamp_diff(next_timestamp, self.timestamp) as usize;
            let end = (pos + mis_samples).min(frame.len());

            pos = self.read_missing_samples(frame, pos, end);
        }

        if pos < frame.len() {
            pos = self.read_packet_samples(frame, pos);
        }

        pos
    }

    fn read_packet_samples(&mut self, frame: &mut Frame, pos: usize) -> usize {
        // ---
        let num_channels = self.sample_spec.num_channels();
        let max_samples = (frame.len() - pos) / num_channels;

        let packet = self.packet.as_ref().unwrap();
        let num_samples = self.decoder.read(
            packet.payload(),
            &mut frame.data_mut()[pos..],
            max_samples,
            &self.sample_spec,
        );

        self.timestamp = self.timestamp.wrapping_add(num_samples as Timestamp);
        self.packet_samples += num_samples as u64;

        if num_samples < max_samples {
            self.decoder.end();
            self.packet = None;
        }

        pos + num_samples * num_channels
    }

    fn read_missing_samples(&mut self, frame: &mut Frame, pos: usize, end: usize) -> usize {
        // ---
        let num_channels = self.sample_spec.num_channels();
        let num_samples = (end - pos) / num_channels;

        let buf = &mut frame.data_mut()[pos..pos + num_samples * num_channels];
        if self.beep {
            write_beep(buf);
        } else {
            write_zeros(buf);
        }

        self.timestamp = self.timestamp.wrapping_add(num_samples as Timestamp);

        if self.first_packet {
            self.zero_samples += num_samples as u64;
        } else {
            self.missing_samples += num_samples as u64;
        }

        pos + num_samples * num_channels
    }

    fn update_packet(&mut self, upstream: &mut dyn PacketReader) {
        // ---
        if self.packet.is_some() {
            return;
        }

        let mut n_dropped = 0;
        let mut pkt_timestamp = 0;

        while let Some(packet) = upstream.read() {
            let rtp = packet.rtp.as_ref().expect("depacketizer: non-rtp packet");
            self.decoder.begin(rtp.timestamp, packet.payload().len());

            pkt_timestamp = self.decoder.position();

            if self.first_packet {
                self.packet = Some(packet);
                break;
            }

            let pkt_end = pkt_timestamp.wrapping_add(self.decoder.available());

            if timestamp_lt(self.timestamp, pkt_end) {
                self.packet = Some(packet);
                break;
            }

            debug!(
                "depacketizer: dropping late packet: ts={} pkt_ts={}",
                self.timestamp, pkt_timestamp
            );
            n_dropped += 1;
            self.decoder.end();
        }

        if n_dropped != 0 {
            debug!(
                "depacketizer: fetched={} dropped={}",
                self.packet.is_some(),
                n_dropped
            );
            self.dropped_packets += n_dropped;
        }

        if self.packet.is_none() {
            return;
        }

        if self.first_packet {
            debug!(
                "depacketizer: got first packet: zero_samples={}",
                self.zero_samples
            );
            self.timestamp = pkt_timestamp;
            self.first_packet = false;
        }

        // The packet may start before the playout position; skip the
        // already-played prefix.
        if timestamp_lt(pkt_timestamp, self.timestamp) {
            let diff = timestamp_diff(self.timestamp, pkt_timestamp) as usize;
            if self.decoder.shift(diff) != diff {
                panic!("depacketizer: can't shift packet");
            }
        }
    }

    fn set_frame_flags(&self, frame: &mut Frame, prev_dropped: u64, prev_packet_samples: u64) {
        // ---
        let packet_samples =
            self.sample_spec.num_channels() * (self.packet_samples - prev_packet_samples) as usize;

        let mut frame_flags = 0;

        if packet_samples != frame.len() {
            frame_flags |= flags::INCOMPLETE;
        }
        if packet_samples == 0 {
            frame_flags |= flags::BLANK;
        }
        if prev_dropped != self.dropped_packets {
            frame_flags |= flags::DROPS;
        }

        frame.set_flags(frame_flags);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::packet::{Packet, RtpAttrs};
    use crate::pcm::PcmEncoder;
    use crate::pool::BufferPool;
    use crate::rtp::PcmFormat;
    use crate::sample::CHANNEL_MASK_MONO;
    use std::collections::VecDeque;

    struct Feed(VecDeque<PacketPtr>);

    impl PacketReader for Feed {
        fn read(&mut self) -> Option<PacketPtr> {
            self.0.pop_front()
        }
    }

    const SPEC: SampleSpec = SampleSpec::new(44100, CHANNEL_MASK_MONO);

    fn make_packet(seqnum: u16, timestamp: u32, samples: &[Sample]) -> PacketPtr {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 1024, 0);
        let mut encoder = PcmEncoder::new(PcmFormat::L16Mono);

        let mut data = pool.allocate().unwrap();
        data.truncate(encoder.encoded_size(samples.len()));
        let mut packet = Packet::new(data);
        let len = packet.data().len();
        packet.set_payload(0..len);

        encoder.begin();
        encoder.write(packet.payload_mut(), samples, samples.len(), &SPEC);
        encoder.end();

        packet.rtp = Some(RtpAttrs {
            source: 1,
            seqnum,
            timestamp,
            duration: samples.len() as u32,
            payload_type: 11,
        });
        packet.into_shared()
    }

    fn depacketizer() -> Depacketizer {
        Depacketizer::new(PcmDecoder::new(PcmFormat::L16Mono), SPEC, false)
    }

    fn read_frame(d: &mut Depacketizer, feed: &mut Feed, len: usize) -> (Vec<Sample>, u32) {
        // ---
        let mut buf = vec![0.0; len];
        let mut frame = Frame::new(&mut buf);
        d.read(&mut frame, feed);
        let frame_flags = frame.flags();
        (buf, frame_flags)
    }

    fn assert_near(actual: &[Sample], expected: &[Sample]) {
        // ---
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1.0 / 32768.0, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_continuous_stream() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([
            make_packet(0, 100, &[0.1, 0.2, 0.3, 0.4]),
            make_packet(1, 104, &[0.5, 0.6, 0.7, 0.8]),
        ]));

        let (samples, frame_flags) = read_frame(&mut d, &mut feed, 8);
        assert_near(&samples, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);
        assert_eq!(frame_flags, 0);
        assert!(d.started());
        assert_eq!(d.timestamp(), 108);
    }

    #[test]
    fn test_packet_spans_frames() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([make_packet(
            0,
            0,
            &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
        )]));

        let (first, _) = read_frame(&mut d, &mut feed, 4);
        assert_near(&first, &[0.1, 0.2, 0.3, 0.4]);

        let (second, frame_flags) = read_frame(&mut d, &mut feed, 4);
        assert_near(&second, &[0.5, 0.6, 0.0, 0.0]);
        assert_ne!(frame_flags & flags::INCOMPLETE, 0);
    }

    #[test]
    fn test_gap_filled_with_silence() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([
            make_packet(0, 0, &[0.1, 0.2]),
            // Packet at ts 4: samples 2..4 are missing
            make_packet(2, 4, &[0.5, 0.6]),
        ]));

        let (samples, frame_flags) = read_frame(&mut d, &mut feed, 6);
        assert_near(&samples, &[0.1, 0.2, 0.0, 0.0, 0.5, 0.6]);
        assert_ne!(frame_flags & flags::INCOMPLETE, 0);
        assert_eq!(d.missing_samples(), 2);
    }

    #[test]
    fn test_no_packets_produces_blank_frame() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::new());

        let (samples, frame_flags) = read_frame(&mut d, &mut feed, 4);
        assert_near(&samples, &[0.0; 4]);
        assert_ne!(frame_flags & flags::BLANK, 0);
        assert!(!d.started());
        assert_eq!(d.timestamp(), 0);
    }

    #[test]
    fn test_late_packet_dropped() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([make_packet(5, 1000, &[0.1, 0.2])]));

        let (_, _) = read_frame(&mut d, &mut feed, 2);
        assert_eq!(d.timestamp(), 1002);

        // A packet entirely before the playout position is dropped
        feed.0.push_back(make_packet(3, 990, &[0.9, 0.9]));
        feed.0.push_back(make_packet(6, 1002, &[0.3, 0.4]));

        let (samples, frame_flags) = read_frame(&mut d, &mut feed, 2);
        assert_near(&samples, &[0.3, 0.4]);
        assert_ne!(frame_flags & flags::DROPS, 0);
    }

    #[test]
    fn test_partially_late_packet_shifted() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([make_packet(0, 0, &[0.1, 0.2, 0.3, 0.4])]));

        let (_, _) = read_frame(&mut d, &mut feed, 2);
        assert_eq!(d.timestamp(), 2);

        // Overlapping packet: its first two samples were already played
        feed.0
            .push_back(make_packet(1, 2, &[0.3, 0.4, 0.5, 0.6]));
        // The in-progress packet finishes first, then the overlap is skipped
        let (samples, _) = read_frame(&mut d, &mut feed, 4);
        assert_near(&samples, &[0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_timestamp_advances_per_frame() {
        // ---
        let mut d = depacketizer();
        let mut feed = Feed(VecDeque::from([make_packet(0, 50, &[0.1, 0.2, 0.3, 0.4])]));

        read_frame(&mut d, &mut feed, 2);
        assert_eq!(d.timestamp(), 52);
        read_frame(&mut d, &mut feed, 2);
        assert_eq!(d.timestamp(), 54);
        read_frame(&mut d, &mut feed, 2);
        assert_eq!(d.timestamp(), 56);
    }
}
