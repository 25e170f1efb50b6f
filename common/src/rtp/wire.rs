//! Wire layout: RTP header and FEC footer.
//!
//! Source packets are `[12-byte RTP header][payload][12-byte FEC footer]`
//! when the stream is FEC-protected, or header plus payload when it is not.
//! Repair streams omit RTP entirely: `[payload][12-byte FEC footer]`.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! FEC footer: `{block_number: u16, source_block_length: u16,
//! repair_block_length: u16, encoding_symbol_id: u16, payload_id: u32}`,
//! all big-endian.

use tracing::debug;

use crate::endpoint::Protocol;
use crate::packet::{flags, FecAttrs, Packet, RtpAttrs};
use crate::rtp::format::FormatMap;

/// Fixed RTP header size in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

/// FEC footer size in bytes.
pub const FEC_FOOTER_SIZE: usize = 12;

const RTP_VERSION: u8 = 2;

/// Lays the packet's attributes out into its wire buffer.
///
/// Expects the payload range to be set and the buffer sized to hold the
/// header, payload, and footer. Returns `false` (after a debug log) when the
/// attributes and buffer disagree.
pub fn compose(packet: &mut Packet) -> bool {
    // ---
    if packet.has_flags(flags::COMPOSED) {
        return true;
    }

    if let Some(rtp) = packet.rtp.clone() {
        if packet.data().len() < RTP_HEADER_SIZE {
            debug!("rtp compose: buffer too small for header");
            return false;
        }

        let data = packet.data_mut();
        data[0] = RTP_VERSION << 6;
        data[1] = rtp.payload_type & 0x7F;
        data[2..4].copy_from_slice(&rtp.seqnum.to_be_bytes());
        data[4..8].copy_from_slice(&rtp.timestamp.to_be_bytes());
        data[8..12].copy_from_slice(&rtp.source.to_be_bytes());
    }

    if let Some(fec) = packet.fec.clone() {
        if packet.data().len() < FEC_FOOTER_SIZE {
            debug!("rtp compose: buffer too small for footer");
            return false;
        }

        let footer_off = packet.data().len() - FEC_FOOTER_SIZE;
        let data = packet.data_mut();

        let footer = &mut data[footer_off..];
        footer[0..2].copy_from_slice(&fec.blknum.to_be_bytes());
        footer[2..4].copy_from_slice(&fec.source_block_len.to_be_bytes());
        footer[4..6].copy_from_slice(&fec.repair_block_len.to_be_bytes());
        footer[6..8].copy_from_slice(&fec.encoding_symbol_id.to_be_bytes());
        footer[8..12].copy_from_slice(&fec.payload_id.to_be_bytes());
    }

    packet.add_flags(flags::COMPOSED);
    true
}

/// Populates the packet's attributes from its wire buffer according to the
/// port protocol the packet arrived on.
///
/// Returns `false` (after a debug log) on any malformed input; the caller
/// drops the packet.
pub fn parse(protocol: Protocol, packet: &mut Packet) -> bool {
    // ---
    match protocol {
        Protocol::Rtp => parse_source(packet, false),
        Protocol::RtpRs8mSource | Protocol::RtpLdpcSource => parse_source_fec(protocol, packet),
        Protocol::Rs8mRepair | Protocol::LdpcRepair => parse_repair(protocol, packet),
    }
}

fn parse_source(packet: &mut Packet, has_footer: bool) -> bool {
    // ---
    let len = packet.data().len();
    let trailer = if has_footer { FEC_FOOTER_SIZE } else { 0 };

    if len < RTP_HEADER_SIZE + trailer {
        debug!("rtp parse: packet too small: len={}", len);
        return false;
    }

    let data = packet.data();

    let version = data[0] >> 6;
    if version != RTP_VERSION {
        debug!("rtp parse: bad version: {}", version);
        return false;
    }

    let payload_type = data[1] & 0x7F;
    let format = match FormatMap::format(payload_type) {
        Some(format) => format,
        None => {
            debug!("rtp parse: unknown payload type: {}", payload_type);
            return false;
        }
    };

    let seqnum = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let source = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let payload_len = len - RTP_HEADER_SIZE - trailer;
    let duration = format.pcm.samples_from_payload_size(payload_len) as u32;

    packet.rtp = Some(RtpAttrs {
        source,
        seqnum,
        timestamp,
        duration,
        payload_type,
    });
    packet.set_payload(RTP_HEADER_SIZE..RTP_HEADER_SIZE + payload_len);
    packet.add_flags(flags::AUDIO | flags::PARSED);

    true
}

fn parse_source_fec(protocol: Protocol, packet: &mut Packet) -> bool {
    // ---
    if !parse_source(packet, true) {
        return false;
    }

    let len = packet.data().len();
    let fec = match parse_footer(protocol, &packet.data()[len - FEC_FOOTER_SIZE..]) {
        Some(fec) => fec,
        None => return false,
    };

    packet.fec = Some(fec);
    true
}

fn parse_repair(protocol: Protocol, packet: &mut Packet) -> bool {
    // ---
    let len = packet.data().len();
    if len <= FEC_FOOTER_SIZE {
        debug!("rtp parse: repair packet too small: len={}", len);
        return false;
    }

    let fec = match parse_footer(protocol, &packet.data()[len - FEC_FOOTER_SIZE..]) {
        Some(fec) => fec,
        None => return false,
    };

    packet.fec = Some(fec);
    packet.set_payload(0..len - FEC_FOOTER_SIZE);
    packet.add_flags(flags::REPAIR | flags::PARSED);

    true
}

fn parse_footer(protocol: Protocol, footer: &[u8]) -> Option<FecAttrs> {
    // ---
    let blknum = u16::from_be_bytes([footer[0], footer[1]]);
    let source_block_len = u16::from_be_bytes([footer[2], footer[3]]);
    let repair_block_len = u16::from_be_bytes([footer[4], footer[5]]);
    let encoding_symbol_id = u16::from_be_bytes([footer[6], footer[7]]);
    let payload_id = u32::from_be_bytes([footer[8], footer[9], footer[10], footer[11]]);

    if source_block_len == 0 {
        debug!("rtp parse: fec footer with empty source block");
        return None;
    }

    if encoding_symbol_id >= source_block_len + repair_block_len {
        debug!(
            "rtp parse: fec footer esi out of block: esi={} sblen={} rblen={}",
            encoding_symbol_id, source_block_len, repair_block_len
        );
        return None;
    }

    Some(FecAttrs {
        scheme: protocol.fec_scheme(),
        blknum,
        encoding_symbol_id,
        source_block_len,
        repair_block_len,
        payload_id,
    })
}
