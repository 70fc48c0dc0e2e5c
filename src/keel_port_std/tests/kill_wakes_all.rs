use keel_port_std as port;
use port::{Semaphore, WaitError};
use std::sync::atomic::{AtomicUsize, Ordering};

static SEM: Semaphore = Semaphore::new(0, 10);
static DONE: Semaphore = Semaphore::new(0, 3);
static STOPPED: AtomicUsize = AtomicUsize::new(0);

fn waiter(_: usize) {
    assert_eq!(SEM.wait(), Err(WaitError::Stopped));
    STOPPED.fetch_add(1, Ordering::Relaxed);
    DONE.signal().unwrap();
}

#[test]
fn kill_wakes_every_waiter_once() {
    port::boot(4, || {
        port::spawn(1, waiter, 0).unwrap();
        port::spawn(2, waiter, 0).unwrap();
        port::spawn(3, waiter, 0).unwrap();
        assert_eq!(STOPPED.load(Ordering::Relaxed), 0);

        SEM.kill();
        for _ in 0..3 {
            DONE.wait().unwrap();
        }
        assert_eq!(STOPPED.load(Ordering::Relaxed), 3);

        // The semaphore stays usable after a kill
        assert_eq!(SEM.value(), 0);
        SEM.signal().unwrap();
        assert_eq!(SEM.try_wait(), Ok(()));

        // A kill with no waiters only resets the count
        SEM.signal().unwrap();
        SEM.kill();
        assert_eq!(SEM.value(), 0);
    });
}
