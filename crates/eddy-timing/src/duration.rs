use std::{
    ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign},
    str::FromStr,
};

use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};
use serde::{Deserialize, Deserializer, Serialize};

/// Signed nanosecond delta between two [`Instant`](crate::Instant)s.
#[derive(Copy, Clone, Debug, Default, Serialize, Hash, PartialEq)]
#[repr(C)]
pub struct Duration(pub i64);

impl Duration {
    pub const MAX: Duration = Duration(i64::MAX);
    pub const MIN: Duration = Duration(i64::MIN);
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_secs(s: i64) -> Self {
        Duration(s * 1_000_000_000)
    }

    #[inline]
    pub const fn from_millis(s: i64) -> Self {
        Duration(s * 1_000_000)
    }

    #[inline]
    pub const fn from_micros(s: i64) -> Self {
        Duration(s * 1_000)
    }

    #[inline]
    pub const fn from_nanos(s: i64) -> Self {
        Duration(s)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Duration((s * 1_000_000_000.0).round() as i64)
    }

    #[inline]
    pub fn from_millis_f64(s: f64) -> Self {
        Duration((s * 1_000_000.0).round() as i64)
    }

    #[inline]
    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    #[inline]
    pub fn as_millis(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[inline]
    pub fn as_micros(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn abs(self) -> Self {
        Duration(self.0.abs())
    }

    #[inline]
    pub const fn saturating_add(self, rhs: Duration) -> Self {
        Duration(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub const fn saturating_sub(self, rhs: Duration) -> Self {
        Duration(self.0.saturating_sub(rhs.0))
    }

    /// Larger of `self` and `rhs`.
    #[inline]
    pub fn max(self, rhs: Duration) -> Self {
        Duration(self.0.max(rhs.0))
    }

    /// Smaller of `self` and `rhs`.
    #[inline]
    pub fn min(self, rhs: Duration) -> Self {
        Duration(self.0.min(rhs.0))
    }

    /// Negative values clamp to zero.
    #[inline]
    pub fn clamp_non_negative(self) -> Self {
        Duration(self.0.max(0))
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 0 {
            write!(f, "-")?;
        }
        let n = self.0.unsigned_abs();
        if n < 1_000 {
            write!(f, "{n}ns")
        } else if n < 1_000_000 {
            write!(f, "{}μs", n as f64 / 1_000.0)
        } else if n < 1_000_000_000 {
            write!(f, "{}ms", n as f64 / 1_000_000.0)
        } else if n < 60 * 1_000_000_000 {
            write!(f, "{}s", (n / 1_000_000) as f64 / 1_000.0)
        } else {
            let mins = n / 60_000_000_000;
            let rest = Duration((n - mins * 60_000_000_000) as i64);
            write!(f, "{mins}m:{rest}")
        }
    }
}

impl FromStr for Duration {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let parsed: std::time::Duration = body.parse::<HumanDuration>()?.into();
        let nanos = parsed.as_nanos().min(i64::MAX as u128) as i64;
        Ok(Duration(if negative { -nanos } else { nanos }))
    }
}

impl<'de> serde::Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer nanosecond count or a string with a unit suffix")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(Duration(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Duration(value.min(i64::MAX as u64) as i64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Duration::from_str(value).map_err(|e| {
                    E::custom(format!("failed to parse '{value}' as a duration: {e}"))
                })
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_any(DurationVisitor)
        } else {
            i64::deserialize(deserializer).map(Duration)
        }
    }
}

impl From<std::time::Duration> for Duration {
    #[inline]
    fn from(value: std::time::Duration) -> Self {
        Duration(value.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl From<Duration> for std::time::Duration {
    /// Negative durations clamp to zero.
    #[inline]
    fn from(value: Duration) -> Self {
        std::time::Duration::from_nanos(value.0.max(0) as u64)
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Neg for Duration {
    type Output = Duration;

    #[inline]
    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

impl Mul<i64> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u32) -> Duration {
        Duration(self.0 * rhs as i64)
    }
}

impl Mul<Duration> for i64 {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: Duration) -> Duration {
        rhs * self
    }
}

impl MulAssign<i64> for Duration {
    #[inline]
    fn mul_assign(&mut self, rhs: i64) {
        *self = *self * rhs;
    }
}

impl Div<i64> for Duration {
    type Output = Duration;

    #[inline]
    fn div(self, rhs: i64) -> Duration {
        Duration(self.0 / rhs)
    }
}

impl Div<u32> for Duration {
    type Output = Duration;

    #[inline]
    fn div(self, rhs: u32) -> Duration {
        Duration(self.0 / rhs as i64)
    }
}

impl Div<Duration> for Duration {
    type Output = i64;

    #[inline]
    fn div(self, rhs: Duration) -> i64 {
        self.0 / rhs.0
    }
}

impl DivAssign<i64> for Duration {
    #[inline]
    fn div_assign(&mut self, rhs: i64) {
        *self = *self / rhs;
    }
}

impl Eq for Duration {}

impl PartialOrd for Duration {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Duration {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::iter::Sum for Duration {
    #[inline]
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        Duration(iter.map(|v| v.0).sum())
    }
}

impl<'a> std::iter::Sum<&'a Self> for Duration {
    #[inline]
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
    {
        Duration(iter.map(|v| v.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_seconds() {
        let result: Duration = serde_json::from_str(r#""10s""#).unwrap();
        assert_eq!(result, Duration::from_secs(10));
    }

    #[test]
    fn from_string_float_milliseconds() {
        let result: Duration = serde_json::from_str(r#""11.12ms""#).unwrap();
        assert_eq!(result, Duration::from_micros(11_120));
    }

    #[test]
    fn from_string_microseconds() {
        let result: Duration = serde_json::from_str(r#""12us""#).unwrap();
        assert_eq!(result, Duration::from_micros(12));
    }

    #[test]
    fn from_number() {
        let result: Duration = serde_json::from_str(r#"1"#).unwrap();
        assert_eq!(result, Duration(1));
    }

    #[test]
    fn negative_string() {
        let result = Duration::from_str("-250ms").unwrap();
        assert_eq!(result, Duration::from_millis(-250));
        assert!(result.is_negative());
        assert_eq!(std::time::Duration::from(result), std::time::Duration::ZERO);
    }

    #[test]
    fn display_buckets() {
        assert_eq!(Duration::from_nanos(999).to_string(), "999ns");
        assert_eq!(Duration::from_micros(12).to_string(), "12μs");
        assert_eq!(Duration::from_millis(5).to_string(), "5ms");
        assert_eq!(Duration::from_secs(-3).to_string(), "-3s");
    }
}
