use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::{Duration, clock::monotonic_nanos};

/// Monotonic timestamp: nanoseconds since an arbitrary process-local epoch.
///
/// Never goes backward within a process. Comparable and subtractable only
/// against other `Instant`s from the same process.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, Hash, PartialEq)]
#[repr(C)]
pub struct Instant(pub u64);

impl Instant {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        Instant(monotonic_nanos())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Instant::now() - *self
    }

    /// Signed distance from `since` to `self` (negative if `self` is earlier).
    #[inline]
    pub fn since(&self, since: Instant) -> Duration {
        *self - since
    }

    /// Distance from `since` to `self`, clamped below at zero.
    #[inline]
    pub fn saturating_since(&self, since: Instant) -> Duration {
        Duration(self.0.saturating_sub(since.0) as i64)
    }

    #[inline]
    pub fn checked_add(self, rhs: Duration) -> Option<Instant> {
        self.0.checked_add_signed(rhs.0).map(Instant)
    }
}

impl Eq for Instant {}

impl PartialOrd for Instant {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0 as i64 - rhs.0 as i64)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Saturates at the epoch when `rhs` is negative beyond `self`.
    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add_signed(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add_signed(-rhs.0))
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl SubAssign<Duration> for Instant {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_subtraction() {
        let a = Instant(1_000);
        let b = Instant(4_000);
        assert_eq!(b - a, Duration(3_000));
        assert_eq!(a - b, Duration(-3_000));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn add_negative_duration() {
        let a = Instant(1_000);
        assert_eq!(a + Duration(-400), Instant(600));
        assert_eq!(a + Duration(-2_000), Instant::ZERO);
    }

    #[test]
    fn now_is_monotonic() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
    }
}
