//! Packet interleaver.
//!
//! Reorders outgoing packets inside a window of one FEC block (source plus
//! repair packets) so that a network burst loss does not wipe out adjacent
//! positions of a single block. The permutation is a fixed coprime stride
//! over the window, so the receiver's sorted queue restores order.

use tracing::debug;

use crate::packet::{Packet, PacketWriter};

/// Fixed-window permuting packet writer.
pub struct Interleaver {
    slots: Vec<Option<Packet>>,
    order: Vec<usize>,
    pos: usize,
}

impl Interleaver {
    // ---
    /// Creates an interleaver over a window of `block_len` packets.
    pub fn new(block_len: usize) -> Self {
        // ---
        let block_len = block_len.max(1);

        // Smallest stride > 1 coprime with the window, falling back to 1
        // for tiny windows.
        let stride = (2..block_len).find(|s| gcd(*s, block_len) == 1).unwrap_or(1);

        let order = (0..block_len).map(|i| (i * stride) % block_len).collect();

        debug!("interleaver: initializing: block_len={} stride={}", block_len, stride);

        Self {
            slots: (0..block_len).map(|_| None).collect(),
            order,
            pos: 0,
        }
    }

    /// Buffers one packet, emitting the whole window downstream in permuted
    /// order once it fills.
    pub fn write(&mut self, packet: Packet, downstream: &mut dyn PacketWriter) {
        // ---
        let idx = self.pos % self.slots.len();
        self.slots[idx] = Some(packet);
        self.pos += 1;

        if self.pos % self.slots.len() == 0 {
            for &slot in &self.order {
                if let Some(packet) = self.slots[slot].take() {
                    downstream.write(packet);
                }
            }
        }
    }

    /// Emits any buffered packets in slot order.
    pub fn flush(&mut self, downstream: &mut dyn PacketWriter) {
        // ---
        for slot in &mut self.slots {
            if let Some(packet) = slot.take() {
                downstream.write(packet);
            }
        }
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
