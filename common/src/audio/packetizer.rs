//! Packetizer.
//!
//! Slices the outgoing frame stream into RTP packets of a fixed duration.
//! Keeps one in-progress packet and a fill position; frames may be smaller
//! or larger than a packet, so a frame can finish several packets and a
//! packet can span several frames.

use rand::Rng;
use tracing::{debug, error};

use crate::frame::Frame;
use crate::packet::{flags, Packet, PacketWriter, RtpAttrs};
use crate::pcm::PcmEncoder;
use crate::pool::BufferPool;
use crate::rtp::{Format, RTP_HEADER_SIZE};
use crate::sample::SampleSpec;
use crate::units::{Nanoseconds, Seqnum, SourceId, Timestamp};

/// Frame writer producing fixed-duration RTP packets.
pub struct Packetizer {
    encoder: PcmEncoder,
    byte_pool: BufferPool<u8>,
    sample_spec: SampleSpec,
    payload_type: u8,
    samples_per_packet: Timestamp,
    payload_size: usize,
    trailer_size: usize,

    packet: Option<Packet>,
    packet_pos: Timestamp,

    source: SourceId,
    seqnum: Seqnum,
    timestamp: Timestamp,
}

impl Packetizer {
    // ---
    /// Creates a packetizer emitting packets of `packet_length` duration.
    ///
    /// `trailer_size` reserves room after the payload for a FEC footer when
    /// the stream is protected. The source id and initial sequence number
    /// and timestamp are chosen randomly.
    pub fn new(
        format: Format,
        sample_spec: SampleSpec,
        packet_length: Nanoseconds,
        trailer_size: usize,
        byte_pool: BufferPool<u8>,
    ) -> Self {
        // ---
        let encoder = PcmEncoder::new(format.pcm);
        let samples_per_packet = format.sample_spec.ns_to_samples(packet_length);
        let payload_size = encoder.encoded_size(samples_per_packet as usize);

        let mut rng = rand::thread_rng();

        debug!(
            "packetizer: initializing: n_channels={} samples_per_packet={}",
            sample_spec.num_channels(),
            samples_per_packet
        );

        Self {
            encoder,
            byte_pool,
            sample_spec,
            payload_type: format.payload_type,
            samples_per_packet,
            payload_size,
            trailer_size,
            packet: None,
            packet_pos: 0,
            source: rng.gen(),
            seqnum: rng.gen(),
            timestamp: rng.gen(),
        }
    }

    /// Returns the stream source id.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Slices one frame into packets, handing completed packets downstream.
    ///
    /// # Panics
    ///
    /// Panics if the frame size is not a multiple of the channel count.
    pub fn write(&mut self, frame: &Frame, downstream: &mut dyn PacketWriter) {
        // ---
        let num_channels = self.sample_spec.num_channels();
        if frame.len() % num_channels != 0 {
            panic!("packetizer: unexpected frame size");
        }

        let mut buffer = frame.data();
        let mut buffer_samples = frame.len() / num_channels;

        while buffer_samples != 0 {
            if self.packet.is_none() && !self.begin_packet() {
                // Pool exhausted: drop the rest of the frame.
                return;
            }

            let ns = buffer_samples.min((self.samples_per_packet - self.packet_pos) as usize);

            let packet = self.packet.as_mut().unwrap();
            let written =
                self.encoder
                    .write(packet.payload_mut(), buffer, ns, &self.sample_spec);
            debug_assert_eq!(written, ns);

            buffer = &buffer[ns * num_channels..];
            buffer_samples -= ns;
            self.packet_pos += ns as Timestamp;

            if self.packet_pos == self.samples_per_packet {
                self.end_packet(downstream);
            }
        }
    }

    /// Finalizes a partially filled packet, if any.
    ///
    /// The payload keeps its full encoded size (the tail stays silent) but
    /// the packet's duration records the actual sample count.
    pub fn flush(&mut self, downstream: &mut dyn PacketWriter) {
        // ---
        if self.packet.is_some() {
            self.end_packet(downstream);
        }
    }

    fn begin_packet(&mut self) -> bool {
        // ---
        let total = RTP_HEADER_SIZE + self.payload_size + self.trailer_size;

        let mut data = match self.byte_pool.allocate() {
            Some(data) => data,
            None => {
                error!("packetizer: can't allocate packet");
                return false;
            }
        };

        if data.len() < total {
            error!(
                "packetizer: packet does not fit pool buffer: need={} have={}",
                total,
                data.len()
            );
            return false;
        }
        data.truncate(total);

        let mut packet = Packet::new(data);
        packet.set_payload(RTP_HEADER_SIZE..RTP_HEADER_SIZE + self.payload_size);
        packet.add_flags(flags::AUDIO);
        packet.rtp = Some(RtpAttrs {
            source: self.source,
            seqnum: self.seqnum,
            timestamp: self.timestamp,
            duration: 0,
            payload_type: self.payload_type,
        });

        self.encoder.begin();
        self.packet = Some(packet);

        true
    }

    fn end_packet(&mut self, downstream: &mut dyn PacketWriter) {
        // ---
        self.encoder.end();

        let mut packet = self.packet.take().unwrap();
        packet.rtp.as_mut().unwrap().duration = self.packet_pos;

        downstream.write(packet);

        self.seqnum = self.seqnum.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.packet_pos);
        self.packet_pos = 0;
    }
}
