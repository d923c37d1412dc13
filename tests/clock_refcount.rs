//! The clock module keeps a process-wide init refcount as a private detail;
//! creating and destroying any number of clocks must leave it at zero. This
//! lives in its own test binary so no other test creates clocks concurrently.

use aircheck::clock::{PtpClock, PtpClockConfig};

#[test]
fn refcount_returns_to_zero() {
    assert_eq!(PtpClock::init_refcount(), 0);

    let clocks: Vec<_> = (0..16)
        .map(|_| PtpClock::new(&PtpClockConfig::default()).unwrap())
        .collect();
    assert_eq!(PtpClock::init_refcount(), 16);

    drop(clocks);
    assert_eq!(PtpClock::init_refcount(), 0);

    // Interleaved create/destroy balances too.
    for _ in 0..8 {
        let clock = PtpClock::new(&PtpClockConfig {
            software: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(PtpClock::init_refcount(), 1);
        drop(clock);
    }
    assert_eq!(PtpClock::init_refcount(), 0);
}
