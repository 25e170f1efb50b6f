//! Session watchdog.
//!
//! Judges session liveness from the frame flags flowing past it. A session
//! dies when nothing but blank frames arrived for too long, or when every
//! detection window inside the breakage timeout contained broken frames.
//! A timeout of zero disables the corresponding check.

use tracing::debug;

use crate::frame::{flags, Frame, FrameReader};
use crate::sample::SampleSpec;
use crate::units::{timestamp_le, Nanoseconds, Timestamp, MILLISECOND, SECOND};

/// Watchdog timeouts.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Session dies when no non-blank frame was produced for this long.
    /// Zero disables the check.
    pub no_playback_timeout: Nanoseconds,

    /// Session dies when every detection window during this period saw
    /// broken frames. Zero disables the check.
    pub broken_playback_timeout: Nanoseconds,

    /// Length of one breakage detection window.
    pub breakage_detection_window: Nanoseconds,

    /// Number of frames in the debug status trace. Zero disables it.
    pub frame_status_window: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        // ---
        Self {
            no_playback_timeout: 2 * SECOND,
            broken_playback_timeout: 2 * SECOND,
            breakage_detection_window: 300 * MILLISECOND,
            frame_status_window: 20,
        }
    }
}

/// Frame reader that monitors stream health and mutes a dead session.
pub struct Watchdog {
    num_channels: usize,

    max_blank_duration: Timestamp,
    max_drops_duration: Timestamp,
    drop_detection_window: Timestamp,

    curr_read_pos: Timestamp,
    last_pos_before_blank: Timestamp,
    last_pos_before_drops: Timestamp,
    curr_window_flags: u32,

    status: Vec<char>,
    status_pos: usize,
    status_show: bool,

    alive: bool,
}

impl Watchdog {
    // ---
    /// Creates a watchdog for a stream with the given sample spec.
    ///
    /// Returns `None` on an invalid configuration (construction error).
    pub fn new(config: &WatchdogConfig, sample_spec: SampleSpec) -> Option<Self> {
        // ---
        if config.no_playback_timeout < 0
            || config.broken_playback_timeout < 0
            || config.breakage_detection_window < 0
        {
            tracing::error!(
                "watchdog: invalid config: no_playback_timeout={} broken_playback_timeout={} breakage_detection_window={}",
                config.no_playback_timeout,
                config.broken_playback_timeout,
                config.breakage_detection_window
            );
            return None;
        }

        let max_blank_duration = sample_spec.ns_to_samples(config.no_playback_timeout);
        let max_drops_duration = sample_spec.ns_to_samples(config.broken_playback_timeout);
        let drop_detection_window = sample_spec.ns_to_samples(config.breakage_detection_window);

        if max_drops_duration != 0
            && (drop_detection_window == 0 || drop_detection_window > max_drops_duration)
        {
            tracing::error!(
                "watchdog: invalid config: breakage_detection_window should be in range (0; broken_playback_timeout]: window={} timeout={}",
                drop_detection_window,
                max_drops_duration
            );
            return None;
        }

        debug!(
            "watchdog: initializing: max_blank_duration={} max_drops_duration={} drop_detection_window={}",
            max_blank_duration, max_drops_duration, drop_detection_window
        );

        Some(Self {
            num_channels: sample_spec.num_channels(),
            max_blank_duration,
            max_drops_duration,
            drop_detection_window,
            curr_read_pos: 0,
            last_pos_before_blank: 0,
            last_pos_before_drops: 0,
            curr_window_flags: 0,
            status: vec!['\0'; config.frame_status_window],
            status_pos: 0,
            status_show: false,
            alive: true,
        })
    }

    /// Returns whether the session is still considered alive.
    ///
    /// Called by the orchestrator on every tick; flips to `false` once the
    /// blank timeout is exceeded.
    pub fn update(&mut self) -> bool {
        // ---
        if !self.alive {
            return false;
        }

        if !self.check_blank_timeout() {
            self.flush_status();
            self.alive = false;
            return false;
        }

        true
    }

    /// Reads one frame through the watchdog, updating health accounting.
    ///
    /// A dead session produces silence.
    pub fn read(&mut self, frame: &mut Frame, upstream: &mut dyn FrameReader) {
        // ---
        if !self.alive {
            frame.data_mut().fill(0.0);
            return;
        }

        upstream.read(frame);

        let next_read_pos = self
            .curr_read_pos
            .wrapping_add((frame.len() / self.num_channels) as Timestamp);

        self.update_blank_timeout(frame, next_read_pos);
        self.update_drops_timeout(frame, next_read_pos);
        self.update_status(frame);

        self.curr_read_pos = next_read_pos;

        if !self.check_drops_timeout() {
            self.flush_status();
            self.alive = false;
        }
    }

    fn update_blank_timeout(&mut self, frame: &Frame, next_read_pos: Timestamp) {
        // ---
        if self.max_blank_duration == 0 {
            return;
        }

        if frame.flags() & flags::BLANK != 0 {
            return;
        }

        self.last_pos_before_blank = next_read_pos;
    }

    fn check_blank_timeout(&self) -> bool {
        // ---
        if self.max_blank_duration == 0 {
            return true;
        }

        if self.curr_read_pos.wrapping_sub(self.last_pos_before_blank) < self.max_blank_duration {
            return true;
        }

        debug!(
            "watchdog: blank timeout reached: every frame was blank during timeout: curr_read_pos={} last_pos_before_blank={} max_blank_duration={}",
            self.curr_read_pos, self.last_pos_before_blank, self.max_blank_duration
        );

        false
    }

    fn update_drops_timeout(&mut self, frame: &Frame, next_read_pos: Timestamp) {
        // ---
        if self.max_drops_duration == 0 {
            return;
        }

        self.curr_window_flags |= frame.flags();

        let window_start =
            self.curr_read_pos / self.drop_detection_window * self.drop_detection_window;
        let window_end = window_start.wrapping_add(self.drop_detection_window);

        if timestamp_le(window_end, next_read_pos) {
            let drop_flags = flags::INCOMPLETE | flags::DROPS;

            if self.curr_window_flags & drop_flags != drop_flags {
                self.last_pos_before_drops = next_read_pos;
            }

            if next_read_pos % self.drop_detection_window == 0 {
                self.curr_window_flags = 0;
            } else {
                self.curr_window_flags = frame.flags();
            }
        }
    }

    fn check_drops_timeout(&self) -> bool {
        // ---
        if self.max_drops_duration == 0 {
            return true;
        }

        if self.curr_read_pos.wrapping_sub(self.last_pos_before_drops) < self.max_drops_duration {
            return true;
        }

        debug!(
            "watchdog: drops timeout reached: every window had drops during timeout: curr_read_pos={} last_pos_before_drops={} drop_detection_window={} max_drops_duration={}",
            self.curr_read_pos,
            self.last_pos_before_drops,
            self.drop_detection_window,
            self.max_drops_duration
        );

        false
    }

    fn update_status(&mut self, frame: &Frame) {
        // ---
        if self.status.is_empty() {
            return;
        }

        let frame_flags = frame.flags();

        let symbol = if frame_flags & flags::BLANK != 0 {
            if frame_flags & flags::DROPS != 0 {
                'B'
            } else {
                'b'
            }
        } else if frame_flags & flags::INCOMPLETE != 0 {
            if frame_flags & flags::DROPS != 0 {
                'I'
            } else {
                'i'
            }
        } else if frame_flags & flags::DROPS != 0 {
            'D'
        } else {
            '.'
        };

        self.status[self.status_pos] = symbol;
        self.status_pos += 1;
        self.status_show = self.status_show || symbol != '.';

        if self.status_pos == self.status.len() {
            self.flush_status();
        }
    }

    fn flush_status(&mut self) {
        // ---
        if self.status_pos == 0 {
            return;
        }

        if self.status_show {
            let trace: String = self.status[..self.status_pos].iter().collect();
            debug!("watchdog: status: {}", trace);
        }

        self.status_pos = 0;
        self.status_show = false;
    }
}
