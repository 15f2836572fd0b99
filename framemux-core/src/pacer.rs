//! Frame pacing for file-backed sources.
//!
//! Reading frames from a file is far faster than real time. The pacer
//! compares how many frames have been streamed against how many the
//! wall clock allows at the target fps and sleeps off the excess:
//!
//! ```text
//!   allowed = floor(fps * elapsed) + 2
//!   delay   = (streamed - allowed) * mean(last 10 frame times)   if streamed > allowed
//! ```
//!
//! Live sources (cameras) are already real time; in `Live` mode nothing
//! is delayed and the measured frame time is handed back so the caller can
//! pass it to the encoder as an explicit frame duration.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Frame times averaged by default.
pub const DEFAULT_WINDOW: usize = 10;

/// Frames the stream may run ahead of the wall clock before sleeping.
pub const FRAME_MARGIN: u64 = 2;

// ── MovingWindow ─────────────────────────────────────────────────

/// Fixed-capacity ring of recent samples.
///
/// Until the ring wraps the mean covers only the filled entries.
#[derive(Debug, Clone)]
pub struct MovingWindow {
    values: Vec<f64>,
    pos: usize,
    wrapped: bool,
}

impl MovingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![0.0; capacity.max(1)],
            pos: 0,
            wrapped: false,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values[self.pos] = value;
        self.pos += 1;
        if self.pos == self.values.len() {
            self.pos = 0;
            self.wrapped = true;
        }
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            self.values.len()
        } else {
            self.pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Mean of the filled entries, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        let n = self.len();
        if n == 0 {
            return 0.0;
        }
        self.values[..n].iter().sum::<f64>() / n as f64
    }
}

impl Default for MovingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Sleep needed to bring `streamed` frames back in line with `fps`.
pub fn pacing_delay(
    streamed: u64,
    fps: f64,
    elapsed: Duration,
    mean_frame_time: Duration,
) -> Duration {
    if !fps.is_finite() || fps <= 0.0 {
        return Duration::ZERO;
    }
    let allowed = (fps * elapsed.as_secs_f64()).floor() as u64 + FRAME_MARGIN;
    if streamed <= allowed {
        return Duration::ZERO;
    }
    mean_frame_time.saturating_mul((streamed - allowed).min(u32::MAX as u64) as u32)
}

// ── FramePacer ───────────────────────────────────────────────────

/// How the source is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingMode {
    /// Throttle a faster-than-real-time source down to `fps`.
    #[default]
    Throttle,
    /// Real-time source: no delay, report frame durations instead.
    Live,
    /// Neither delay nor duration reporting.
    Off,
}

/// Timing of one completed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    /// Time since the previous frame completed.
    pub frame_time: Duration,
    /// Time since the pacer started.
    pub elapsed: Duration,
    /// Sleep owed before the next frame.
    pub delay: Duration,
}

/// Tracks streamed frames against the wall clock.
#[derive(Debug)]
pub struct FramePacer {
    fps: f64,
    mode: PacingMode,
    window: MovingWindow,
    start: Instant,
    prev: Instant,
    streamed: u64,
}

impl FramePacer {
    pub fn new(fps: f64, mode: PacingMode) -> Self {
        Self::with_window(fps, mode, DEFAULT_WINDOW)
    }

    pub fn with_window(fps: f64, mode: PacingMode, window: usize) -> Self {
        Self::starting_at(fps, mode, window, Instant::now())
    }

    pub fn starting_at(fps: f64, mode: PacingMode, window: usize, start: Instant) -> Self {
        Self {
            fps,
            mode,
            window: MovingWindow::new(window),
            start,
            prev: start,
            streamed: 0,
        }
    }

    pub fn mode(&self) -> PacingMode {
        self.mode
    }

    pub fn streamed_frames(&self) -> u64 {
        self.streamed
    }

    pub fn mean_frame_time(&self) -> Duration {
        Duration::from_secs_f64(self.window.mean())
    }

    /// Record a completed frame at `now` without sleeping.
    pub fn frame_done_at(&mut self, now: Instant) -> FrameTiming {
        let frame_time = now.saturating_duration_since(self.prev);
        let elapsed = now.saturating_duration_since(self.start);
        self.prev = now;

        let delay = match self.mode {
            PacingMode::Throttle => {
                self.streamed += 1;
                self.window.push(frame_time.as_secs_f64());
                pacing_delay(self.streamed, self.fps, elapsed, self.mean_frame_time())
            }
            PacingMode::Off => {
                self.streamed += 1;
                Duration::ZERO
            }
            PacingMode::Live => Duration::ZERO,
        };

        FrameTiming {
            frame_time,
            elapsed,
            delay,
        }
    }

    /// Record a completed frame now and sleep off any excess.
    pub fn frame_done(&mut self) -> FrameTiming {
        let timing = self.frame_done_at(Instant::now());
        if !timing.delay.is_zero() {
            trace!(
                frame = self.streamed,
                delay_us = timing.delay.as_micros() as u64,
                "pacing delay"
            );
            std::thread::sleep(timing.delay);
        }
        timing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn window_mean_before_and_after_wrap() {
        let mut w = MovingWindow::new(3);
        assert_eq!(w.mean(), 0.0);
        w.push(1.0);
        w.push(2.0);
        assert_eq!(w.len(), 2);
        assert!((w.mean() - 1.5).abs() < 1e-12);
        w.push(3.0);
        w.push(10.0);
        assert_eq!(w.len(), 3);
        assert!((w.mean() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn partial_window_averages_filled_slots() {
        let mut w = MovingWindow::new(10);
        for v in [1.0, 2.0, 3.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert!((w.mean() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn eleventh_value_evicts_the_first() {
        let mut w = MovingWindow::new(10);
        for v in 1..=11 {
            w.push(v as f64);
        }
        assert_eq!(w.len(), 10);
        // 2..=11
        assert!((w.mean() - 6.5).abs() < 1e-12);
    }

    #[test]
    fn first_frame_past_margin_costs_one_mean() {
        let mean = 7 * MS;
        assert_eq!(
            pacing_delay(32, 30.0, Duration::from_secs(1), mean),
            Duration::ZERO
        );
        assert_eq!(pacing_delay(33, 30.0, Duration::from_secs(1), mean), mean);
    }

    #[test]
    fn no_delay_within_margin() {
        // 1s at 30 fps allows 30 frames plus 2 of margin
        assert_eq!(
            pacing_delay(32, 30.0, Duration::from_secs(1), MS),
            Duration::ZERO
        );
        assert_eq!(pacing_delay(35, 30.0, Duration::from_secs(1), MS), 3 * MS);
    }

    #[test]
    fn fast_source_is_throttled() {
        // 60 frames after 1s at 30 fps, 5ms mean: 28 excess frames
        let delay = pacing_delay(60, 30.0, Duration::from_secs(1), 5 * MS);
        assert_eq!(delay, 28 * 5 * MS);
    }

    #[test]
    fn zero_fps_never_delays() {
        assert_eq!(
            pacing_delay(100, 0.0, Duration::from_secs(1), MS),
            Duration::ZERO
        );
    }

    #[test]
    fn throttle_counts_frames() {
        let start = Instant::now();
        let mut pacer = FramePacer::starting_at(30.0, PacingMode::Throttle, 10, start);
        let mut last = None;
        for i in 1..=5u32 {
            last = Some(pacer.frame_done_at(start + MS * i));
        }
        let timing = last.unwrap();
        assert_eq!(pacer.streamed_frames(), 5);
        assert_eq!(timing.frame_time, MS);
        assert_eq!(timing.elapsed, 5 * MS);
        // 5 frames in 5ms: 3 over the allowance of 2
        assert!((timing.delay.as_secs_f64() - 0.003).abs() < 1e-6);
    }

    #[test]
    fn live_mode_reports_frame_time_only() {
        let start = Instant::now();
        let mut pacer = FramePacer::starting_at(30.0, PacingMode::Live, 10, start);
        pacer.frame_done_at(start + 40 * MS);
        let timing = pacer.frame_done_at(start + 73 * MS);
        assert_eq!(timing.frame_time, 33 * MS);
        assert_eq!(timing.delay, Duration::ZERO);
        assert_eq!(pacer.streamed_frames(), 0);
    }

    #[test]
    fn off_mode_counts_without_delay() {
        let start = Instant::now();
        let mut pacer = FramePacer::starting_at(1.0, PacingMode::Off, 10, start);
        for i in 1..=10u32 {
            assert_eq!(pacer.frame_done_at(start + MS * i).delay, Duration::ZERO);
        }
        assert_eq!(pacer.streamed_frames(), 10);
    }
}
