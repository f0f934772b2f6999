use std::sync::Arc;

use once_cell::sync::OnceCell;
use quanta::Mock;

pub type Clock = quanta::Clock;

// Initialized exactly once; either the real clock or a test mock.
static GLOBAL_CLOCK: OnceCell<Clock> = OnceCell::new();

/// Install a mock as the process-wide clock and return its controller.
///
/// Must win the race against every other clock user: the first call to
/// [`Instant::now`](crate::Instant::now) freezes whichever clock is installed.
#[inline]
pub fn init_global_with_mock() -> Arc<Mock> {
    let (clock, controller) = Clock::mock();
    let installed = GLOBAL_CLOCK.get_or_init(|| clock);
    assert_eq!(installed.raw(), 0, "global clock was already initialized before the mock");
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static Clock {
    GLOBAL_CLOCK.get_or_init(Clock::new)
}

/// Nanoseconds since an arbitrary process-local epoch. Monotonic.
#[inline]
pub(crate) fn monotonic_nanos() -> u64 {
    let clock = global_clock();
    clock.delta_as_nanos(0, clock.raw())
}
