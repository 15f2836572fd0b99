//! Rational time bases and presentation timestamps.
//!
//! Frame rates are carried as exact rationals so that NTSC-style rates
//! (29.97, 59.94) survive the trip into the codec. Timestamps are counted
//! in ticks of the codec time base and rescaled into the container's
//! stream time base before muxing.
//!
//! ```text
//!  fps (f64) ──► frame rate (n/d) ──► best fit ──► codec time base (d/n)
//!                                   (if the codec lists rates)
//! ```

use std::cmp::Ordering;
use std::fmt;

use crate::error::EncoderError;

/// Largest denominator the fps search will try before settling.
const MAX_RATE_BASE: i64 = 1_000_000;

/// Tolerance between the requested fps and its rational approximation.
const RATE_TOLERANCE: f64 = 0.001;

/// An exact fraction `num / den` with a positive denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Approximate a floating-point frame rate.
    ///
    /// Starts from the rounded integer rate and multiplies the base by ten
    /// until the fraction is within 0.001 of `fps`: 30.0 gives 30/1,
    /// 29.97 gives 2997/100.
    pub fn from_fps(fps: f64) -> Self {
        let mut base: i64 = 1;
        let mut rate = (fps + 0.5) as i64;
        while (rate as f64 / base as f64 - fps).abs() > RATE_TOLERANCE && base < MAX_RATE_BASE {
            base *= 10;
            rate = (fps * base as f64 + 0.5) as i64;
        }
        Self::new(rate.clamp(0, i32::MAX as i64) as i32, base as i32)
    }

    /// The reciprocal: a frame rate becomes a time base and vice versa.
    pub const fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Absolute distance `|self - other|` as an unreduced `(num, den)` pair.
    fn distance(self, other: Rational) -> (i128, i128) {
        let num = self.num as i128 * other.den as i128 - other.num as i128 * self.den as i128;
        (num.abs(), self.den as i128 * other.den as i128)
    }

    /// Pick the entry of `supported` closest to `self`.
    ///
    /// Ties keep the earliest entry. Returns `None` for an empty list.
    pub fn best_fit(self, supported: &[Rational]) -> Option<Rational> {
        let mut best: Option<(Rational, (i128, i128))> = None;
        for &candidate in supported.iter().filter(|r| r.den != 0) {
            let error = self.distance(candidate);
            let closer = match best {
                None => true,
                Some((_, best_error)) => cmp_fraction(error, best_error) == Ordering::Less,
            };
            if closer {
                best = Some((candidate, error));
            }
        }
        best.map(|(rate, _)| rate)
    }

    /// Convert a duration in seconds into ticks of this time base.
    pub fn ticks_from_secs(self, secs: f64) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        secs * self.den as f64 / self.num as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn cmp_fraction(a: (i128, i128), b: (i128, i128)) -> Ordering {
    (a.0 * b.1).cmp(&(b.0 * a.1))
}

/// Rescale `value` from time base `from` to time base `to`.
///
/// Rounds to nearest with halves away from zero, matching libavutil's
/// default rounding for packet timestamps.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return value;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let q = if num >= 0 {
        (num + half) / den
    } else {
        -((-num + half) / den)
    };
    q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Derive the codec time base for `fps`.
///
/// When the codec advertises a list of supported frame rates the
/// closest entry wins and the time base is its reciprocal. Codecs that
/// accept any rate keep the direct approximation.
pub fn derive_time_base(fps: f64, supported: Option<&[Rational]>) -> Rational {
    let requested = Rational::from_fps(fps);
    let rate = supported
        .and_then(|rates| requested.best_fit(rates))
        .unwrap_or(requested);
    rate.invert()
}

// ── Presentation timestamps ─────────────────────────────────────

/// How a frame's PTS was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtsPolicy {
    /// No duration supplied: one codec tick per frame, rescaled on mux.
    FixedIncrement,
    /// Caller-supplied duration, already in stream ticks.
    ExplicitDuration,
}

impl PtsPolicy {
    /// Whether packets produced under this policy need rescaling from
    /// the codec time base into the stream time base.
    pub fn needs_rescale(self) -> bool {
        matches!(self, PtsPolicy::FixedIncrement)
    }
}

/// The PTS assigned to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub pts: i64,
    pub policy: PtsPolicy,
}

/// Monotonic PTS generator.
///
/// The first frame gets PTS 0. Each later frame advances by one tick, or
/// by `round(duration)` when a non-zero duration is supplied. An advance
/// is never smaller than one tick, so timestamps stay strictly increasing
/// even for tiny or negative durations. Durations that do not fit in 64
/// bits of ticks, and advances past `i64::MAX`, are errors and leave the
/// counter untouched.
#[derive(Debug, Default)]
pub struct PtsCounter {
    last: Option<i64>,
}

impl PtsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }

    /// The stamp the next frame would get, without consuming it.
    pub fn peek(&self, duration: f64) -> Result<Stamp, EncoderError> {
        if duration.is_nan() || duration == 0.0 {
            let pts = self.step(1)?;
            return Ok(Stamp {
                pts,
                policy: PtsPolicy::FixedIncrement,
            });
        }
        let ticks = duration.round();
        if !ticks.is_finite() || ticks.abs() >= i64::MAX as f64 {
            return Err(EncoderError::InvalidDuration(duration));
        }
        let pts = self.step((ticks as i64).max(1))?;
        Ok(Stamp {
            pts,
            policy: PtsPolicy::ExplicitDuration,
        })
    }

    /// Record `stamp` as the latest frame's.
    pub fn commit(&mut self, stamp: Stamp) {
        self.last = Some(stamp.pts);
    }

    pub fn advance(&mut self, duration: f64) -> Result<Stamp, EncoderError> {
        let stamp = self.peek(duration)?;
        self.commit(stamp);
        Ok(stamp)
    }

    fn step(&self, ticks: i64) -> Result<i64, EncoderError> {
        match self.last {
            None => Ok(0),
            Some(last) => last.checked_add(ticks).ok_or(EncoderError::PtsOverflow(last)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_fps_is_exact() {
        assert_eq!(Rational::from_fps(30.0), Rational::new(30, 1));
        assert_eq!(Rational::from_fps(25.0), Rational::new(25, 1));
    }

    #[test]
    fn fractional_fps_grows_base() {
        assert_eq!(Rational::from_fps(29.97), Rational::new(2997, 100));
        assert_eq!(Rational::from_fps(12.5), Rational::new(125, 10));
    }

    #[test]
    fn time_base_inverts_rate() {
        assert_eq!(derive_time_base(30.0, None), Rational::new(1, 30));
        assert_eq!(derive_time_base(29.97, None), Rational::new(100, 2997));
    }

    #[test]
    fn best_fit_picks_closest_rate() {
        let rates = [
            Rational::new(24000, 1001),
            Rational::new(24, 1),
            Rational::new(25, 1),
            Rational::new(30000, 1001),
            Rational::new(30, 1),
        ];
        assert_eq!(
            derive_time_base(29.97, Some(&rates)),
            Rational::new(1001, 30000)
        );
        assert_eq!(derive_time_base(31.0, Some(&rates)), Rational::new(1, 30));
    }

    #[test]
    fn best_fit_tie_keeps_first() {
        let rates = [Rational::new(24, 1), Rational::new(26, 1)];
        assert_eq!(
            Rational::new(25, 1).best_fit(&rates),
            Some(Rational::new(24, 1))
        );
        assert_eq!(Rational::new(25, 1).best_fit(&[]), None);
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        let codec = Rational::new(1, 30);
        let stream = Rational::new(1, 1000);
        assert_eq!(rescale(0, codec, stream), 0);
        assert_eq!(rescale(1, codec, stream), 33);
        assert_eq!(rescale(2, codec, stream), 67);
        assert_eq!(rescale(30, codec, stream), 1000);
        assert_eq!(rescale(-1, codec, stream), -33);
        // 1/2 tick away from zero
        assert_eq!(rescale(1, Rational::new(1, 2), Rational::new(1, 1)), 1);
    }

    #[test]
    fn ticks_from_secs_uses_reciprocal() {
        let tb = Rational::new(1, 1000);
        assert!((tb.ticks_from_secs(0.040) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn pts_fixed_increment() {
        let mut pts = PtsCounter::new();
        let stamps: Vec<_> = (0..4).map(|_| pts.advance(0.0).unwrap()).collect();
        assert_eq!(
            stamps.iter().map(|s| s.pts).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(stamps.iter().all(|s| s.policy.needs_rescale()));
    }

    #[test]
    fn pts_explicit_duration_is_rounded() {
        let mut pts = PtsCounter::new();
        assert_eq!(pts.advance(40.0).unwrap().pts, 0);
        assert_eq!(pts.advance(40.4).unwrap().pts, 40);
        assert_eq!(pts.advance(33.6).unwrap().pts, 74);
        let stamp = pts.advance(10.0).unwrap();
        assert_eq!(stamp.pts, 84);
        assert_eq!(stamp.policy, PtsPolicy::ExplicitDuration);
        assert!(!stamp.policy.needs_rescale());
    }

    #[test]
    fn pts_never_stalls() {
        let mut pts = PtsCounter::new();
        pts.advance(0.2).unwrap();
        assert_eq!(pts.advance(0.2).unwrap().pts, 1);
        assert_eq!(pts.advance(-5.0).unwrap().pts, 2);
        assert_eq!(pts.last(), Some(2));
    }

    #[test]
    fn pts_rejects_unrepresentable_durations() {
        let mut pts = PtsCounter::new();
        pts.advance(0.0).unwrap();
        for bad in [f64::INFINITY, f64::NEG_INFINITY, 1e30] {
            assert!(matches!(
                pts.advance(bad),
                Err(EncoderError::InvalidDuration(d)) if d == bad
            ));
        }
        // rejected durations leave the counter where it was
        assert_eq!(pts.last(), Some(0));
        assert_eq!(pts.advance(40.0).unwrap().pts, 40);
    }

    #[test]
    fn pts_overflow_is_an_error() {
        let mut pts = PtsCounter::new();
        pts.commit(Stamp {
            pts: i64::MAX - 1,
            policy: PtsPolicy::FixedIncrement,
        });
        assert_eq!(pts.advance(0.0).unwrap().pts, i64::MAX);
        assert!(matches!(
            pts.advance(0.0),
            Err(EncoderError::PtsOverflow(i64::MAX))
        ));
        assert_eq!(pts.last(), Some(i64::MAX));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut pts = PtsCounter::new();
        pts.advance(0.0).unwrap();
        assert_eq!(pts.peek(0.0).unwrap().pts, 1);
        assert_eq!(pts.peek(0.0).unwrap().pts, 1);
        assert_eq!(pts.last(), Some(0));
    }
}
