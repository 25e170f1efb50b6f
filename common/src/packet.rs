//! Network packet representation.
//!
//! A packet owns its wire buffer plus optional attribute groups populated
//! while it travels through the pipeline: UDP addresses at the transport
//! edge, RTP fields once parsed or composed, FEC block metadata when the
//! stream is protected. Flags describe which roles the packet plays.
//!
//! On the sender side packets are plain mutable values moving down a writer
//! chain; on the receiver side they are frozen into `PacketPtr` (an `Arc`)
//! so queues, FEC blocks, and the decoder can share them. A packet's buffer
//! returns to its pool when the last reference drops.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;

use crate::pool::PooledBuffer;
use crate::units::{Blknum, Seqnum, SourceId, Timestamp};

/// Shared handle to a finalized packet.
pub type PacketPtr = Arc<Packet>;

/// Packet role flags.
pub mod flags {
    /// Carries audio payload.
    pub const AUDIO: u32 = 1 << 0;

    /// Carries FEC repair payload.
    pub const REPAIR: u32 = 1 << 1;

    /// Attribute groups were populated from the wire buffer.
    pub const PARSED: u32 = 1 << 2;

    /// Wire buffer was laid out from the attribute groups.
    pub const COMPOSED: u32 = 1 << 3;

    /// Payload was reconstructed by the FEC reader rather than received.
    pub const RESTORED: u32 = 1 << 4;
}

/// Forward error correction scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FecScheme {
    /// No redundancy.
    Disable,

    /// Reed-Solomon over GF(2^8).
    ReedSolomonM8,

    /// LDPC-Staircase.
    LdpcStaircase,
}

/// Transport-level addresses.
#[derive(Debug, Clone, Copy)]
pub struct UdpAttrs {
    /// Address the packet came from.
    pub src_addr: SocketAddr,

    /// Address the packet was sent to.
    pub dst_addr: SocketAddr,
}

/// RTP header fields.
#[derive(Debug, Clone)]
pub struct RtpAttrs {
    /// Stream source identifier (SSRC).
    pub source: SourceId,

    /// Sequence number.
    pub seqnum: Seqnum,

    /// Stream timestamp of the first sample in the payload.
    pub timestamp: Timestamp,

    /// Payload duration in samples per channel.
    pub duration: Timestamp,

    /// Payload type number.
    pub payload_type: u8,
}

/// FEC block metadata.
#[derive(Debug, Clone)]
pub struct FecAttrs {
    /// Scheme protecting this stream.
    pub scheme: FecScheme,

    /// Block this packet belongs to.
    pub blknum: Blknum,

    /// Index of the packet inside the block (source packets first, then
    /// repair packets).
    pub encoding_symbol_id: u16,

    /// Number of source packets in the block.
    pub source_block_len: u16,

    /// Number of repair packets in the block.
    pub repair_block_len: u16,

    /// Stream identifier carried in the footer for repair-only streams.
    pub payload_id: u32,
}

/// A single network datagram and its in-memory attributes.
pub struct Packet {
    flags: u32,
    data: PooledBuffer<u8>,
    payload: Range<usize>,

    /// Transport addresses, present once the packet touched a socket.
    pub udp: Option<UdpAttrs>,

    /// RTP fields, present once parsed or prepared for composition.
    pub rtp: Option<RtpAttrs>,

    /// FEC metadata, present on protected streams.
    pub fec: Option<FecAttrs>,
}

impl Packet {
    // ---
    /// Creates a packet owning the given wire buffer, with no attributes.
    pub fn new(data: PooledBuffer<u8>) -> Self {
        // ---
        Self {
            flags: 0,
            data,
            payload: 0..0,
            udp: None,
            rtp: None,
            fec: None,
        }
    }

    /// Returns the packet flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Merges flags into the packet.
    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    /// Returns whether every bit of `flags` is set.
    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags & flags == flags
    }

    /// Returns the whole wire buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the whole wire buffer for writing.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrinks the wire buffer to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Marks `range` of the wire buffer as the codec payload area.
    pub fn set_payload(&mut self, range: Range<usize>) {
        self.payload = range;
    }

    /// Returns the codec payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload.clone()]
    }

    /// Returns the codec payload bytes for writing.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.payload.clone()]
    }

    /// Returns the stream timestamp of the packet's first sample.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no RTP attributes.
    pub fn begin(&self) -> Timestamp {
        // ---
        self.rtp
            .as_ref()
            .expect("packet: begin() on non-rtp packet")
            .timestamp
    }

    /// Returns the stream timestamp one past the packet's last sample.
    ///
    /// # Panics
    ///
    /// Panics if the packet has no RTP attributes.
    pub fn end(&self) -> Timestamp {
        // ---
        let rtp = self.rtp.as_ref().expect("packet: end() on non-rtp packet");
        rtp.timestamp.wrapping_add(rtp.duration)
    }

    /// Freezes the packet into a shared handle.
    pub fn into_shared(self) -> PacketPtr {
        Arc::new(self)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("Packet")
            .field("flags", &self.flags)
            .field("len", &self.data.len())
            .field("rtp", &self.rtp)
            .field("fec", &self.fec)
            .finish()
    }
}

/// Consumer of finalized packets on the sender side.
pub trait PacketWriter: Send {
    /// Takes ownership of one packet.
    fn write(&mut self, packet: Packet);
}

/// Producer of shared packets on the receiver side.
///
/// Returns `None` when no packet is currently available; callers treat the
/// absence as a gap, not an error.
pub trait PacketReader: Send {
    /// Yields the next packet, if any.
    fn read(&mut self) -> Option<PacketPtr>;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::pool::BufferPool;

    fn make_packet() -> Packet {
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        Packet::new(pool.allocate().unwrap())
    }

    #[test]
    fn test_flags() {
        // ---
        let mut packet = make_packet();

        packet.add_flags(flags::AUDIO);
        assert!(packet.has_flags(flags::AUDIO));
        assert!(!packet.has_flags(flags::AUDIO | flags::REPAIR));

        packet.add_flags(flags::REPAIR);
        assert!(packet.has_flags(flags::AUDIO | flags::REPAIR));
    }

    #[test]
    fn test_begin_end_wraparound() {
        // ---
        let mut packet = make_packet();
        packet.rtp = Some(RtpAttrs {
            source: 1,
            seqnum: 0,
            timestamp: u32::MAX - 9,
            duration: 20,
            payload_type: 10,
        });

        assert_eq!(packet.begin(), u32::MAX - 9);
        assert_eq!(packet.end(), 10);
    }

    #[test]
    fn test_payload_range() {
        // ---
        let mut packet = make_packet();
        packet.data_mut()[12] = 7;
        packet.set_payload(12..16);

        assert_eq!(packet.payload().len(), 4);
        assert_eq!(packet.payload()[0], 7);
    }
}
