use keel_port_std as port;
use port::{Semaphore, WaitError, IMMEDIATE};

static SEM: Semaphore = Semaphore::new(0, 1);

#[test]
fn virtual_time_and_timeouts() {
    port::boot(4, || {
        // A sleeping task never wakes before its delay has elapsed
        let t0 = port::tick_count();
        port::sleep_for(100);
        assert!(port::tick_count().wrapping_sub(t0) >= 100);

        // Likewise for a timed wait that expires
        let t1 = port::tick_count();
        assert_eq!(SEM.wait_for(30), Err(WaitError::Timeout));
        assert!(port::tick_count().wrapping_sub(t1) >= 30);

        // Waiting until a point that has already passed returns at once
        let t2 = port::tick_count();
        port::sleep_until(t2);
        assert_eq!(port::tick_count(), t2);
        assert_eq!(SEM.wait_until(t2), Err(WaitError::Timeout));
        assert_eq!(port::tick_count(), t2);

        // Absolute sleeps land on or after the requested point
        port::sleep_until(t2.wrapping_add(10));
        assert!(port::tick_count().wrapping_sub(t2) >= 10);

        // IMMEDIATE never blocks
        port::sleep_for(IMMEDIATE);

        // Explicitly delivered ticks drive the same clock
        let t3 = port::tick_count();
        port::deliver_ticks(7);
        assert_eq!(port::tick_count(), t3.wrapping_add(7));
    });
}
