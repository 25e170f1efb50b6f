//! RTP stream validation.
//!
//! Checks each packet against the last accepted one: the source id and
//! payload type must not change, and sequence number and timestamp jumps
//! must stay inside configured bounds. Packets failing a check are withheld
//! from the downstream reader; a genuine stream discontinuity therefore
//! starves the session until the watchdog tears it down.

use tracing::debug;

use crate::packet::{PacketPtr, PacketReader};
use crate::sample::SampleSpec;
use crate::units::{seqnum_diff, seqnum_lt, timestamp_diff, Nanoseconds, SECOND};

/// Validator bounds.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum allowed sequence number jump between adjacent packets.
    pub max_sn_jump: u16,

    /// Maximum allowed timestamp jump between adjacent packets, as a
    /// duration.
    pub max_ts_jump: Nanoseconds,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        // ---
        Self {
            max_sn_jump: 100,
            max_ts_jump: SECOND,
        }
    }
}

/// Drops packets that violate stream continuity bounds.
pub struct RtpValidator {
    config: ValidatorConfig,
    sample_spec: SampleSpec,
    prev: Option<PacketPtr>,
}

impl RtpValidator {
    // ---
    /// Creates a validator for a stream with the given sample spec.
    pub fn new(config: ValidatorConfig, sample_spec: SampleSpec) -> Self {
        // ---
        Self {
            config,
            sample_spec,
            prev: None,
        }
    }

    /// Reads the next packet from `upstream`, withholding invalid ones.
    pub fn read(&mut self, upstream: &mut dyn PacketReader) -> Option<PacketPtr> {
        // ---
        let next = upstream.read()?;

        if next.rtp.is_none() {
            debug!("rtp validator: unexpected non-rtp packet");
            return None;
        }

        if let Some(prev) = &self.prev {
            if !self.check(prev, &next) {
                return None;
            }
        }

        let newer = match &self.prev {
            Some(prev) => seqnum_lt(
                prev.rtp.as_ref().unwrap().seqnum,
                next.rtp.as_ref().unwrap().seqnum,
            ),
            None => true,
        };
        if newer {
            self.prev = Some(next.clone());
        }

        Some(next)
    }

    fn check(&self, prev: &PacketPtr, next: &PacketPtr) -> bool {
        // ---
        let prev = prev.rtp.as_ref().unwrap();
        let next = next.rtp.as_ref().unwrap();

        if prev.source != next.source {
            debug!(
                "rtp validator: source id jump: prev={} next={}",
                prev.source, next.source
            );
            return false;
        }

        if prev.payload_type != next.payload_type {
            debug!(
                "rtp validator: payload type jump: prev={} next={}",
                prev.payload_type, next.payload_type
            );
            return false;
        }

        let sn_dist = seqnum_diff(next.seqnum, prev.seqnum).unsigned_abs();
        if sn_dist > self.config.max_sn_jump {
            debug!(
                "rtp validator: too long seqnum jump: prev={} next={} dist={}",
                prev.seqnum, next.seqnum, sn_dist
            );
            return false;
        }

        let ts_dist = timestamp_diff(next.timestamp, prev.timestamp).unsigned_abs();
        let ts_dist_ns = self.sample_spec.samples_to_ns(ts_dist.min(i32::MAX as u32) as i32);
        if ts_dist_ns > self.config.max_ts_jump {
            debug!(
                "rtp validator: too long timestamp jump: prev={} next={} dist={}",
                prev.timestamp, next.timestamp, ts_dist
            );
            return false;
        }

        true
    }
}
