use keel_port_std as port;
use port::{Semaphore, WaitError, IMMEDIATE};

static SEM: Semaphore = Semaphore::new(2, 3);
static CLAMPED: Semaphore = Semaphore::new(9, 3);
static EMPTY: Semaphore = Semaphore::new(0, 1);
static FULL: Semaphore = Semaphore::new(3, 3);
static DONE: Semaphore = Semaphore::new(0, 1);

fn sender(_: usize) {
    // The semaphore is full; this blocks until a taker makes room
    FULL.send().unwrap();
    DONE.signal().unwrap();
}

#[test]
fn counting_semaphore_bounds() {
    port::boot(4, || {
        // An initial count above the limit is clamped to the limit
        assert_eq!(CLAMPED.value(), 3);

        assert_eq!(SEM.value(), 2);
        assert_eq!(SEM.try_wait(), Ok(()));
        assert_eq!(SEM.try_wait(), Ok(()));
        assert_eq!(SEM.try_wait(), Err(WaitError::Timeout));
        assert_eq!(SEM.value(), 0);

        for _ in 0..3 {
            assert_eq!(SEM.signal(), Ok(()));
        }
        assert_eq!(SEM.value(), 3);
        // The count never exceeds the limit
        assert_eq!(SEM.signal(), Err(WaitError::Timeout));
        assert_eq!(SEM.send_for(IMMEDIATE), Err(WaitError::Timeout));
        assert_eq!(SEM.value(), 3);

        // A timed wait on an empty semaphore expires, driven by virtual time
        let t0 = port::tick_count();
        assert_eq!(EMPTY.wait_for(5), Err(WaitError::Timeout));
        assert!(port::tick_count().wrapping_sub(t0) >= 5);

        // A sender blocked on a full semaphore is completed by a take: the
        // pending deposit replaces the permit just taken, so the count never
        // leaves `0..=limit`
        port::spawn(1, sender, 0).unwrap();
        assert_eq!(FULL.value(), 3);
        assert_eq!(FULL.try_wait(), Ok(()));
        DONE.wait().unwrap();
        assert_eq!(FULL.value(), 3);
        for _ in 0..3 {
            assert_eq!(FULL.try_wait(), Ok(()));
        }
        assert_eq!(FULL.try_wait(), Err(WaitError::Timeout));
        assert_eq!(FULL.value(), 0);
    });
}
