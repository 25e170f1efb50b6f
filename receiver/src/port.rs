//! Receive ports.
//!
//! A port is a bound local endpoint with a protocol. An incoming packet is
//! admitted when some port claims it: the destination port number matches
//! (or the port is bound to 0, autoselect) and the packet parses under the
//! port's protocol.

use tracing::debug;

use rtp_pcm_common::rtp::parse;
use rtp_pcm_common::{Endpoint, Packet, Protocol};

/// One bound receive endpoint.
pub struct ReceiverPort {
    protocol: Protocol,
    bind_port: u16,
}

impl ReceiverPort {
    // ---
    /// Creates a port from a bound endpoint.
    pub fn new(endpoint: &Endpoint) -> Self {
        // ---
        Self {
            protocol: endpoint.protocol,
            bind_port: endpoint.port,
        }
    }

    /// Returns the port's protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Tries to claim a packet: checks the destination address, then
    /// parses the wire buffer under this port's protocol.
    pub fn handle(&self, packet: &mut Packet) -> bool {
        // ---
        if self.bind_port != 0 {
            if let Some(udp) = &packet.udp {
                if udp.dst_addr.port() != self.bind_port {
                    return false;
                }
            }
        }

        if !parse(self.protocol, packet) {
            debug!("port: packet does not parse under {:?}", self.protocol);
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rtp_pcm_common::rtp::{compose, PAYLOAD_TYPE_L16_STEREO, RTP_HEADER_SIZE};
    use rtp_pcm_common::{packet_flags, BufferPool, RtpAttrs, UdpAttrs};

    fn wire_packet(dst_port: u16) -> Packet {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut data = pool.allocate().unwrap();
        data.truncate(RTP_HEADER_SIZE + 8);
        let mut composed = Packet::new(data);
        composed.set_payload(RTP_HEADER_SIZE..RTP_HEADER_SIZE + 8);
        composed.rtp = Some(RtpAttrs {
            source: 1,
            seqnum: 0,
            timestamp: 0,
            duration: 2,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
        });
        assert!(compose(&mut composed));

        let pool2: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut data = pool2.allocate().unwrap();
        data.truncate(composed.data().len());
        data.copy_from_slice(composed.data());
        let mut packet = Packet::new(data);
        packet.udp = Some(UdpAttrs {
            src_addr: "10.0.0.1:4000".parse().unwrap(),
            dst_addr: format!("10.0.0.2:{}", dst_port).parse().unwrap(),
        });
        packet
    }

    #[test]
    fn test_claims_matching_packet() {
        // ---
        let port = ReceiverPort::new(&Endpoint::from_uri("rtp://0.0.0.0:5004").unwrap());

        let mut packet = wire_packet(5004);
        assert!(port.handle(&mut packet));
        assert!(packet.has_flags(packet_flags::AUDIO | packet_flags::PARSED));
    }

    #[test]
    fn test_rejects_wrong_destination_port() {
        // ---
        let port = ReceiverPort::new(&Endpoint::from_uri("rtp://0.0.0.0:5004").unwrap());

        let mut packet = wire_packet(6000);
        assert!(!port.handle(&mut packet));
    }

    #[test]
    fn test_port_zero_claims_any_destination() {
        // ---
        let port = ReceiverPort::new(&Endpoint::from_uri("rtp://0.0.0.0:0").unwrap());

        let mut packet = wire_packet(6000);
        assert!(port.handle(&mut packet));
    }

    #[test]
    fn test_rejects_garbage() {
        // ---
        let port = ReceiverPort::new(&Endpoint::from_uri("rtp://0.0.0.0:0").unwrap());

        let pool: BufferPool<u8> = BufferPool::new("test", 64, 0);
        let mut data = pool.allocate().unwrap();
        data.truncate(20);
        data.fill(0xFF);
        let mut packet = Packet::new(data);
        assert!(!port.handle(&mut packet));
    }
}
