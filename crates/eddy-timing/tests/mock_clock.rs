use eddy_timing::{Duration, Instant, init_global_with_mock};

// Own test binary: the mock must win the global-clock race, so nothing else
// in this process may touch the clock first.
#[test]
fn mocked_clock_drives_instants() {
    let mock = init_global_with_mock();

    let start = Instant::now();
    assert_eq!(start, Instant(1));

    mock.increment(250);
    assert_eq!(Instant::now() - start, Duration::from_nanos(250));

    mock.increment(1_000_000);
    assert!(start.elapsed() >= Duration::from_millis(1));
}
