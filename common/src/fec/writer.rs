//! FEC block writer.
//!
//! Sits between the packetizer and the router on the sender side. Source
//! packets are annotated with block metadata and forwarded immediately;
//! their wire images are accumulated, and when a block fills, the encoder
//! produces repair payloads that are emitted as repair packets.

use tracing::{debug, error};

use crate::fec::codec::BlockEncoder;
use crate::packet::{flags, FecAttrs, FecScheme, Packet, PacketWriter};
use crate::pool::BufferPool;
use crate::rtp::{compose, FEC_FOOTER_SIZE};
use crate::units::Blknum;

/// FEC writer block layout.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Source packets per block.
    pub n_source_packets: usize,

    /// Repair packets per block.
    pub n_repair_packets: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        // ---
        Self {
            n_source_packets: 20,
            n_repair_packets: 10,
        }
    }
}

/// Packet writer adding block-based redundancy to the stream.
pub struct FecWriter {
    scheme: FecScheme,
    encoder: Box<dyn BlockEncoder>,
    byte_pool: BufferPool<u8>,
    n_source: usize,
    n_repair: usize,
    blknum: Blknum,
    block: Vec<Vec<u8>>,
    payload_id: u32,
}

impl FecWriter {
    // ---
    /// Creates a writer for the given scheme and block layout.
    ///
    /// Returns `None` when the scheme has no codec (construction error; the
    /// enclosing pipeline refuses to start).
    pub fn new(config: &WriterConfig, scheme: FecScheme, byte_pool: BufferPool<u8>) -> Option<Self> {
        // ---
        let encoder =
            crate::fec::codec::new_encoder(scheme, config.n_source_packets, config.n_repair_packets)?;

        debug!(
            "fec writer: initializing: scheme={:?} n_source={} n_repair={}",
            scheme, config.n_source_packets, config.n_repair_packets
        );

        Some(Self {
            scheme,
            encoder,
            byte_pool,
            n_source: config.n_source_packets,
            n_repair: config.n_repair_packets,
            blknum: 0,
            block: Vec::with_capacity(config.n_source_packets),
            payload_id: 0,
        })
    }

    /// Annotates and forwards one source packet, emitting repair packets
    /// downstream whenever a block completes.
    pub fn write(&mut self, mut packet: Packet, downstream: &mut dyn PacketWriter) {
        // ---
        let rtp = match &packet.rtp {
            Some(rtp) => rtp.clone(),
            None => {
                debug!("fec writer: dropping non-rtp packet");
                return;
            }
        };

        self.payload_id = rtp.source;

        packet.fec = Some(FecAttrs {
            scheme: self.scheme,
            blknum: self.blknum,
            encoding_symbol_id: self.block.len() as u16,
            source_block_len: self.n_source as u16,
            repair_block_len: self.n_repair as u16,
            payload_id: self.payload_id,
        });

        // The protected unit is the composed header + payload, footer
        // excluded; compose now so the snapshot carries final header bytes.
        if !compose(&mut packet) {
            error!("fec writer: can't compose source packet");
            return;
        }

        let image_len = packet.data().len() - FEC_FOOTER_SIZE;
        let image = packet.data()[..image_len].to_vec();

        if let Some(first) = self.block.first() {
            if first.len() != image.len() {
                error!(
                    "fec writer: source packet size changed inside block: prev={} next={}",
                    first.len(),
                    image.len()
                );
                self.block.clear();
            }
        }

        self.block.push(image);
        downstream.write(packet);

        if self.block.len() == self.n_source {
            self.end_block(downstream);
        }
    }

    fn end_block(&mut self, downstream: &mut dyn PacketWriter) {
        // ---
        let images: Vec<&[u8]> = self.block.iter().map(|b| b.as_slice()).collect();

        if let Some(repair_payloads) = self.encoder.encode(&images) {
            for (index, payload) in repair_payloads.into_iter().enumerate() {
                if let Some(packet) = self.repair_packet(index, &payload) {
                    downstream.write(packet);
                }
            }
        }

        self.block.clear();
        self.blknum = self.blknum.wrapping_add(1);
    }

    fn repair_packet(&mut self, index: usize, payload: &[u8]) -> Option<Packet> {
        // ---
        let mut data = match self.byte_pool.allocate() {
            Some(data) => data,
            None => {
                error!("fec writer: can't allocate repair packet");
                return None;
            }
        };

        let total = payload.len() + FEC_FOOTER_SIZE;
        if data.len() < total {
            error!(
                "fec writer: repair packet does not fit pool buffer: need={} have={}",
                total,
                data.len()
            );
            return None;
        }
        data.truncate(total);
        data[..payload.len()].copy_from_slice(payload);

        let mut packet = Packet::new(data);
        packet.set_payload(0..payload.len());
        packet.add_flags(flags::REPAIR);
        packet.fec = Some(FecAttrs {
            scheme: self.scheme,
            blknum: self.blknum,
            encoding_symbol_id: (self.n_source + index) as u16,
            source_block_len: self.n_source as u16,
            repair_block_len: self.n_repair as u16,
            payload_id: self.payload_id,
        });

        if !compose(&mut packet) {
            error!("fec writer: can't compose repair packet");
            return None;
        }

        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::packet::RtpAttrs;
    use crate::rtp::{RTP_HEADER_SIZE, PAYLOAD_TYPE_L16_STEREO};

    struct Collector(Vec<Packet>);

    impl PacketWriter for Collector {
        fn write(&mut self, packet: Packet) {
            self.0.push(packet);
        }
    }

    fn source_packet(pool: &BufferPool<u8>, seqnum: u16) -> Packet {
        let mut data = pool.allocate().unwrap();
        data.truncate(RTP_HEADER_SIZE + 8 + FEC_FOOTER_SIZE);
        let mut packet = Packet::new(data);
        packet.set_payload(RTP_HEADER_SIZE..RTP_HEADER_SIZE + 8);
        packet.payload_mut().fill(seqnum as u8);
        packet.add_flags(flags::AUDIO);
        packet.rtp = Some(RtpAttrs {
            source: 7,
            seqnum,
            timestamp: seqnum as u32 * 2,
            duration: 2,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
        });
        packet
    }

    fn writer(pool: &BufferPool<u8>, n_source: usize, n_repair: usize) -> FecWriter {
        FecWriter::new(
            &WriterConfig {
                n_source_packets: n_source,
                n_repair_packets: n_repair,
            },
            FecScheme::ReedSolomonM8,
            pool.clone(),
        )
        .expect("fec writer construction failed")
    }

    #[test]
    fn test_emits_repair_after_block() {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut fec = writer(&pool, 4, 2);
        let mut sink = Collector(Vec::new());

        for seq in 0..4 {
            fec.write(source_packet(&pool, seq), &mut sink);
        }

        // 4 source + 2 repair
        assert_eq!(sink.0.len(), 6);

        let repair: Vec<&Packet> = sink.0.iter().filter(|p| p.has_flags(flags::REPAIR)).collect();
        assert_eq!(repair.len(), 2);

        for (i, packet) in repair.iter().enumerate() {
            let fec = packet.fec.as_ref().unwrap();
            assert_eq!(fec.blknum, 0);
            assert_eq!(fec.encoding_symbol_id, (4 + i) as u16);
            assert_eq!(fec.source_block_len, 4);
            assert_eq!(fec.repair_block_len, 2);
            assert_eq!(fec.payload_id, 7);
        }
    }

    #[test]
    fn test_source_packets_annotated_and_forwarded() {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut fec = writer(&pool, 4, 2);
        let mut sink = Collector(Vec::new());

        fec.write(source_packet(&pool, 0), &mut sink);
        fec.write(source_packet(&pool, 1), &mut sink);

        // Forwarded immediately, before the block completes
        assert_eq!(sink.0.len(), 2);

        let fec_attrs = sink.0[1].fec.as_ref().unwrap();
        assert_eq!(fec_attrs.blknum, 0);
        assert_eq!(fec_attrs.encoding_symbol_id, 1);
        assert!(sink.0[1].has_flags(flags::COMPOSED));
    }

    #[test]
    fn test_block_numbers_increment() {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut fec = writer(&pool, 2, 1);
        let mut sink = Collector(Vec::new());

        for seq in 0..6 {
            fec.write(source_packet(&pool, seq), &mut sink);
        }

        let blknums: Vec<u16> = sink
            .0
            .iter()
            .filter(|p| p.has_flags(flags::REPAIR))
            .map(|p| p.fec.as_ref().unwrap().blknum)
            .collect();
        assert_eq!(blknums, vec![0, 1, 2]);
    }
}
