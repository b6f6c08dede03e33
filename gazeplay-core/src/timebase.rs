//! Stream time-bases.
//!
//! A time-base is the real-world length of one timestamp tick, expressed as
//! `num / den` seconds. Matroska clusters tick in nanoseconds, YUV4MPEG2 ticks
//! once per frame, so every packet timestamp has to go through here before it
//! is reported as a position.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds-per-tick as a fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const MILLISECONDS: Rational = Rational { num: 1, den: 1_000 };
    pub const NANOSECONDS: Rational = Rational { num: 1, den: 1_000_000_000 };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// A time-base of zero or negative length can't rescale anything.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Inverse of a frame rate: 25/1 fps becomes a 1/25 s tick.
    pub fn from_frame_rate(fps_num: i64, fps_den: i64) -> Self {
        Self::new(fps_den, fps_num)
    }

    /// Rescale `ticks` of this time-base into milliseconds, rounding to nearest.
    ///
    /// Returns 0 for an invalid time-base.
    pub fn ticks_to_ms(&self, ticks: i64) -> i64 {
        self.rescale(ticks, Rational::MILLISECONDS)
    }

    /// Rescale `ticks` from this time-base into `target`, rounding half away
    /// from zero. Intermediates are 128-bit so nanosecond clocks over long
    /// files don't overflow.
    pub fn rescale(&self, ticks: i64, target: Rational) -> i64 {
        if !self.is_valid() || !target.is_valid() {
            return 0;
        }
        let numer = ticks as i128 * self.num as i128 * target.den as i128;
        let denom = self.den as i128 * target.num as i128;
        let half = denom / 2;
        let rounded = if numer >= 0 {
            (numer + half) / denom
        } else {
            (numer - half) / denom
        };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MILLISECONDS
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_ticks() {
        let tb = Rational::from_frame_rate(10, 1);
        assert_eq!(tb.ticks_to_ms(0), 0);
        assert_eq!(tb.ticks_to_ms(1), 100);
        assert_eq!(tb.ticks_to_ms(9), 900);
    }

    #[test]
    fn test_ntsc_rounding() {
        // 30000/1001 fps, frame 1 is 33.366..ms
        let tb = Rational::from_frame_rate(30_000, 1_001);
        assert_eq!(tb.ticks_to_ms(1), 33);
        assert_eq!(tb.ticks_to_ms(3), 100);
    }

    #[test]
    fn test_nanosecond_clock_does_not_overflow() {
        let three_hours_ns = 3 * 3_600 * 1_000_000_000i64;
        assert_eq!(Rational::NANOSECONDS.ticks_to_ms(three_hours_ns), 10_800_000);
    }

    #[test]
    fn test_invalid_time_base() {
        assert_eq!(Rational::new(0, 1).ticks_to_ms(100), 0);
        assert_eq!(Rational::new(1, 0).ticks_to_ms(100), 0);
        assert!(!Rational::new(1, -5).is_valid());
    }
}
