//! Delayed reader.
//!
//! Withholds the session's packet stream until an initial latency worth of
//! payload is queued, giving the receiver a cushion against network jitter
//! before the first sample is played.

use std::collections::VecDeque;

use tracing::{debug, error};

use crate::packet::{PacketPtr, PacketReader};
use crate::sample::SampleSpec;
use crate::units::{timestamp_diff, Nanoseconds, Timestamp};

/// Packet reader delaying stream start until enough payload accumulated.
pub struct DelayedReader {
    queue: VecDeque<PacketPtr>,
    delay: Timestamp,
    started: bool,
}

impl DelayedReader {
    // ---
    /// Creates a reader withholding packets until `delay` of payload is
    /// buffered.
    pub fn new(delay: Nanoseconds, sample_spec: SampleSpec) -> Self {
        // ---
        let delay = sample_spec.ns_to_samples(delay);

        debug!("delayed reader: initializing: delay={}", delay);

        Self {
            queue: VecDeque::new(),
            delay,
            started: false,
        }
    }

    /// Reads the next packet, or `None` while the initial cushion is still
    /// filling.
    pub fn read(&mut self, upstream: &mut dyn PacketReader) -> Option<PacketPtr> {
        // ---
        if !self.started {
            if !self.fetch_packets(upstream) {
                return None;
            }
            self.started = true;
        }

        if !self.queue.is_empty() {
            return self.read_queued_packet();
        }

        upstream.read()
    }

    fn fetch_packets(&mut self, upstream: &mut dyn PacketReader) -> bool {
        // ---
        while let Some(packet) = upstream.read() {
            self.queue.push_back(packet);
        }

        let qs = self.queue_size();
        if qs < self.delay {
            return false;
        }

        debug!(
            "delayed reader: initial queue: delay={} queue={} packets={}",
            self.delay,
            qs,
            self.queue.len()
        );

        true
    }

    fn read_queued_packet(&mut self) -> Option<PacketPtr> {
        // ---
        let mut trimmed = 0;
        let mut packet;

        loop {
            packet = self.queue.pop_front();

            let qs = self.queue_size();
            if qs < self.delay {
                break;
            }

            trimmed = qs;
        }

        if trimmed != 0 {
            debug!(
                "delayed reader: trimmed queue: delay={} queue={} packets={}",
                self.delay,
                trimmed,
                self.queue.len() + 1
            );
        }

        packet
    }

    fn queue_size(&self) -> Timestamp {
        // ---
        let (head, tail) = match (self.queue.front(), self.queue.back()) {
            (Some(head), Some(tail)) => (head, tail),
            _ => return 0,
        };

        let qs = timestamp_diff(tail.end(), head.begin());
        if qs < 0 {
            error!("delayed reader: unexpected negative queue size: {}", qs);
            return 0;
        }

        qs as Timestamp
    }
}
