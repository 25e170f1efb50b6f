//! Latency control loop.
//!
//! Sender and receiver clocks drift; left alone, the session queue would
//! slowly drain or overflow. The monitor measures the backlog between the
//! newest queued packet and the playout position, checks it against hard
//! bounds, and nudges the resampler scaling so the backlog converges to the
//! target.

use tracing::{debug, error};

use crate::audio::depacketizer::Depacketizer;
use crate::audio::resampler::ResamplerReader;
use crate::queue::SortedQueue;
use crate::sample::SampleSpec;
use crate::units::{timestamp_diff, Nanoseconds, Timestamp, MILLISECOND};

/// Latency monitor tuning.
#[derive(Debug, Clone)]
pub struct LatencyMonitorConfig {
    /// Latency below which the session is torn down.
    pub min_latency: Nanoseconds,

    /// Latency above which the session is torn down.
    pub max_latency: Nanoseconds,

    /// How long the latency may stay out of bounds before the session is
    /// torn down. Zero fails on the first out-of-bounds measurement.
    pub failure_window: Nanoseconds,

    /// How often the frequency estimate is refreshed, as a stream duration.
    pub fe_update_interval: Nanoseconds,

    /// Hard cap on the scaling deviation from 1.0.
    pub max_scaling_delta: f32,
}

impl Default for LatencyMonitorConfig {
    fn default() -> Self {
        // ---
        Self {
            min_latency: -200 * MILLISECOND,
            max_latency: 400 * MILLISECOND,
            failure_window: 0,
            fe_update_interval: 5 * MILLISECOND,
            max_scaling_delta: 0.005,
        }
    }
}

/// Proportional frequency estimator with exponential smoothing.
///
/// Produces the scaling the resampler needs so the observed latency moves
/// toward the target: backlog above target means the stream must be
/// consumed faster, which is a scaling below one.
pub struct FreqEstimator {
    target: f64,
    smoothed: f64,
    started: bool,
    coeff: f64,
}

impl FreqEstimator {
    // ---
    /// Creates an estimator converging on `target` samples of latency.
    pub fn new(target: Timestamp) -> Self {
        // ---
        Self {
            target: target as f64,
            smoothed: target as f64,
            started: false,
            coeff: 1e-2,
        }
    }

    /// Feeds one latency measurement, in samples.
    pub fn update(&mut self, latency: Timestamp) {
        // ---
        const DECAY: f64 = 0.995;

        if !self.started {
            self.smoothed = latency as f64;
            self.started = true;
        } else {
            self.smoothed = self.smoothed * DECAY + latency as f64 * (1.0 - DECAY);
        }
    }

    /// Returns the current scaling estimate.
    pub fn freq_coeff(&self) -> f32 {
        // ---
        (1.0 + self.coeff * (self.target - self.smoothed) / self.target) as f32
    }
}

/// Per-session latency supervision driving the resampler.
pub struct LatencyMonitor {
    fe: FreqEstimator,

    update_interval: Timestamp,
    update_pos: Timestamp,
    has_update_pos: bool,

    target_latency: Timestamp,
    min_latency: i32,
    max_latency: i32,
    failure_window: Timestamp,
    out_of_bounds_since: Option<Timestamp>,
    max_scaling_delta: f32,

    sample_rate_coeff: f32,
    last_report: Timestamp,
}

impl LatencyMonitor {
    // ---
    /// Creates a monitor for a session with input (wire) and output
    /// (playout) sample specs.
    ///
    /// Returns `None` on invalid configuration or when the initial scaling
    /// does not fit the resampler (construction errors). Without a
    /// resampler, the input and output rates must match.
    pub fn new(
        config: &LatencyMonitorConfig,
        target_latency: Nanoseconds,
        input_sample_spec: SampleSpec,
        output_sample_spec: SampleSpec,
        resampler: Option<&mut ResamplerReader>,
    ) -> Option<Self> {
        // ---
        debug!(
            "latency monitor: initializing: target_latency={} in_rate={} out_rate={}",
            target_latency,
            input_sample_spec.sample_rate(),
            output_sample_spec.sample_rate()
        );

        if config.fe_update_interval <= 0 {
            error!(
                "latency monitor: invalid config: fe_update_interval={}",
                config.fe_update_interval
            );
            return None;
        }

        if target_latency < config.min_latency
            || target_latency > config.max_latency
            || target_latency <= 0
        {
            error!(
                "latency monitor: invalid config: target_latency={} min_latency={} max_latency={}",
                target_latency, config.min_latency, config.max_latency
            );
            return None;
        }

        let target = input_sample_spec.ns_to_samples(target_latency);

        let sample_rate_coeff = if let Some(resampler) = resampler {
            if input_sample_spec.sample_rate() == 0 || output_sample_spec.sample_rate() == 0 {
                error!(
                    "latency monitor: invalid sample rates: input={} output={}",
                    input_sample_spec.sample_rate(),
                    output_sample_spec.sample_rate()
                );
                return None;
            }

            let coeff =
                output_sample_spec.sample_rate() as f32 / input_sample_spec.sample_rate() as f32;
            if !resampler.set_scaling(coeff) {
                error!(
                    "latency monitor: scaling factor out of bounds: scaling={:.5}",
                    coeff
                );
                return None;
            }
            coeff
        } else {
            if input_sample_spec.sample_rate() != output_sample_spec.sample_rate() {
                error!(
                    "latency monitor: input and output sample rates must be equal when resampling is disabled: in_rate={} out_rate={}",
                    input_sample_spec.sample_rate(),
                    output_sample_spec.sample_rate()
                );
                return None;
            }
            1.0
        };

        Some(Self {
            fe: FreqEstimator::new(target),
            update_interval: input_sample_spec.ns_to_samples(config.fe_update_interval),
            update_pos: 0,
            has_update_pos: false,
            target_latency: target,
            min_latency: input_sample_spec.ns_to_samples_signed(config.min_latency),
            max_latency: input_sample_spec.ns_to_samples_signed(config.max_latency),
            failure_window: input_sample_spec.ns_to_samples(config.failure_window),
            out_of_bounds_since: None,
            max_scaling_delta: config.max_scaling_delta,
            sample_rate_coeff,
            last_report: 0,
        })
    }

    /// Runs one control step at playout position `pos`.
    ///
    /// Returns `false` when the session must be torn down: latency left the
    /// configured bounds for longer than the failure window, or the
    /// resampler rejected the requested scaling.
    pub fn update(
        &mut self,
        pos: Timestamp,
        queue: &SortedQueue,
        depacketizer: &Depacketizer,
        resampler: Option<&mut ResamplerReader>,
    ) -> bool {
        // ---
        let latency = match self.measure_latency(queue, depacketizer) {
            Some(latency) => latency,
            None => return true,
        };

        if !self.check_latency(pos, latency) {
            return false;
        }

        match resampler {
            Some(resampler) => {
                let latency = latency.max(0) as Timestamp;
                self.update_resampler(pos, latency, resampler)
            }
            None => {
                self.report_latency(pos, latency);
                true
            }
        }
    }

    fn measure_latency(&self, queue: &SortedQueue, depacketizer: &Depacketizer) -> Option<i32> {
        // ---
        if !depacketizer.started() {
            return None;
        }

        let head = depacketizer.timestamp();
        let tail = queue.latest()?.end();

        Some(timestamp_diff(tail, head))
    }

    fn check_latency(&mut self, pos: Timestamp, latency: i32) -> bool {
        // ---
        if latency >= self.min_latency && latency <= self.max_latency {
            self.out_of_bounds_since = None;
            return true;
        }

        let since = *self.out_of_bounds_since.get_or_insert(pos);
        let outside = pos.wrapping_sub(since);

        if outside < self.failure_window {
            return true;
        }

        debug!(
            "latency monitor: latency out of bounds: latency={} min={} max={}",
            latency, self.min_latency, self.max_latency
        );
        false
    }

    fn update_resampler(
        &mut self,
        pos: Timestamp,
        latency: Timestamp,
        resampler: &mut ResamplerReader,
    ) -> bool {
        // ---
        if !self.has_update_pos {
            self.has_update_pos = true;
            self.update_pos = pos;
        }

        while !crate::units::timestamp_lt(pos, self.update_pos) {
            self.fe.update(latency);
            self.update_pos = self.update_pos.wrapping_add(self.update_interval);
        }

        let freq_coeff = self.fe.freq_coeff();
        let trimmed_coeff = self.trim_scaling(freq_coeff);
        let adjusted_coeff = self.sample_rate_coeff * trimmed_coeff;

        if pos.wrapping_sub(self.last_report) > 5 * 44100 {
            self.last_report = pos;
            debug!(
                "latency monitor: latency={} target={} fe={:.5} trim_fe={:.5} adj_fe={:.5}",
                latency, self.target_latency, freq_coeff, trimmed_coeff, adjusted_coeff
            );
        }

        if !resampler.set_scaling(adjusted_coeff) {
            debug!(
                "latency monitor: scaling factor out of bounds: fe={:.5} adj_fe={:.5}",
                freq_coeff, adjusted_coeff
            );
            return false;
        }

        true
    }

    fn trim_scaling(&self, freq_coeff: f32) -> f32 {
        // ---
        let min_coeff = 1.0 - self.max_scaling_delta;
        let max_coeff = 1.0 + self.max_scaling_delta;

        freq_coeff.clamp(min_coeff, max_coeff)
    }

    fn report_latency(&mut self, pos: Timestamp, latency: i32) {
        // ---
        if pos.wrapping_sub(self.last_report) > 5 * 44100 {
            self.last_report = pos;
            debug!(
                "latency monitor: latency={} target={}",
                latency, self.target_latency
            );
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::packet::{Packet, RtpAttrs};
    use crate::pcm::PcmDecoder;
    use crate::pool::BufferPool;
    use crate::queue::{OrderBy, SortedQueue};
    use crate::rtp::PcmFormat;
    use crate::sample::{CHANNEL_MASK_MONO, SampleSpec};
    use crate::units::SECOND;

    const SPEC: SampleSpec = SampleSpec::new(44100, CHANNEL_MASK_MONO);

    fn config() -> LatencyMonitorConfig {
        // ---
        LatencyMonitorConfig {
            min_latency: 0,
            max_latency: 500 * MILLISECOND,
            failure_window: 0,
            fe_update_interval: 5 * MILLISECOND,
            max_scaling_delta: 0.005,
        }
    }

    fn queue_with_packet(timestamp: u32, duration: u32) -> SortedQueue {
        // ---
        let pool: BufferPool<u8> = BufferPool::new("test", 16, 0);
        let mut queue = SortedQueue::new(OrderBy::Seqnum, 0);
        let mut packet = Packet::new(pool.allocate().unwrap());
        packet.rtp = Some(RtpAttrs {
            source: 1,
            seqnum: 0,
            timestamp,
            duration,
            payload_type: 11,
        });
        queue.write(packet.into_shared());
        queue
    }

    /// Depacketizer that consumed up to `timestamp`.
    fn started_depacketizer(timestamp: u32) -> Depacketizer {
        // ---
        use crate::frame::Frame;
        use crate::packet::{PacketPtr, PacketReader};

        struct One(Option<PacketPtr>);
        impl PacketReader for One {
            fn read(&mut self) -> Option<PacketPtr> {
                self.0.take()
            }
        }

        let pool: BufferPool<u8> = BufferPool::new("test", 16, 0);
        let mut data = pool.allocate().unwrap();
        data.truncate(4);
        let mut packet = Packet::new(data);
        let len = packet.data().len();
        packet.set_payload(0..len);
        packet.rtp = Some(RtpAttrs {
            source: 1,
            seqnum: 0,
            timestamp: timestamp.wrapping_sub(2),
            duration: 2,
            payload_type: 11,
        });

        let mut d = Depacketizer::new(PcmDecoder::new(PcmFormat::L16Mono), SPEC, false);
        let mut feed = One(Some(packet.into_shared()));
        let mut buf = vec![0.0; 2];
        let mut frame = Frame::new(&mut buf);
        d.read(&mut frame, &mut feed);
        assert_eq!(d.timestamp(), timestamp);
        d
    }

    #[test]
    fn test_latency_within_bounds_passes() {
        // ---
        let mut monitor =
            LatencyMonitor::new(&config(), 100 * MILLISECOND, SPEC, SPEC, None).unwrap();

        // Playout at 1000, newest packet ends at 1000 + ~4410 (100ms)
        let depacketizer = started_depacketizer(1000);
        let queue = queue_with_packet(1000, 4410);

        assert!(monitor.update(0, &queue, &depacketizer, None));
    }

    #[test]
    fn test_latency_above_max_fails() {
        // ---
        let mut monitor =
            LatencyMonitor::new(&config(), 100 * MILLISECOND, SPEC, SPEC, None).unwrap();

        let depacketizer = started_depacketizer(1000);
        // A second of backlog, above the 500ms bound
        let queue = queue_with_packet(1000, 44100);

        assert!(!monitor.update(0, &queue, &depacketizer, None));
    }

    #[test]
    fn test_not_started_is_tolerated() {
        // ---
        let mut monitor =
            LatencyMonitor::new(&config(), 100 * MILLISECOND, SPEC, SPEC, None).unwrap();

        let depacketizer = Depacketizer::new(PcmDecoder::new(PcmFormat::L16Mono), SPEC, false);
        let queue = SortedQueue::new(OrderBy::Seqnum, 0);

        assert!(monitor.update(0, &queue, &depacketizer, None));
    }

    #[test]
    fn test_failure_window_defers_teardown() {
        // ---
        let mut cfg = config();
        cfg.failure_window = SECOND;
        let mut monitor =
            LatencyMonitor::new(&cfg, 100 * MILLISECOND, SPEC, SPEC, None).unwrap();

        let depacketizer = started_depacketizer(1000);
        let queue = queue_with_packet(1000, 44100);

        // Out of bounds, but inside the failure window
        assert!(monitor.update(0, &queue, &depacketizer, None));
        assert!(monitor.update(22050, &queue, &depacketizer, None));
        // A second later the session fails
        assert!(!monitor.update(44100, &queue, &depacketizer, None));
    }

    #[test]
    fn test_invalid_target_rejected() {
        // ---
        assert!(LatencyMonitor::new(&config(), 0, SPEC, SPEC, None).is_none());
        assert!(LatencyMonitor::new(&config(), SECOND, SPEC, SPEC, None).is_none());
    }

    #[test]
    fn test_rate_mismatch_without_resampler_rejected() {
        // ---
        let out_spec = SampleSpec::new(48000, CHANNEL_MASK_MONO);
        assert!(LatencyMonitor::new(&config(), 100 * MILLISECOND, SPEC, out_spec, None).is_none());
    }

    #[test]
    fn test_freq_estimator_direction() {
        // ---
        let mut fe = FreqEstimator::new(1000);

        // Backlog above target: consume faster, scaling below one
        for _ in 0..100 {
            fe.update(2000);
        }
        assert!(fe.freq_coeff() < 1.0);

        // Backlog below target: consume slower, scaling above one
        let mut fe = FreqEstimator::new(1000);
        for _ in 0..100 {
            fe.update(500);
        }
        assert!(fe.freq_coeff() > 1.0);
    }
}
