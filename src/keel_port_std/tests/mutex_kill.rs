use keel_port_std as port;
use port::{Mutex, Semaphore, UnlockError, WaitError};

static MUTEX: Mutex = Mutex::new();
static HELD: Semaphore = Semaphore::new(0, 1);
static DONE: Semaphore = Semaphore::new(0, 2);

fn holder(_: usize) {
    MUTEX.lock().unwrap();
    HELD.signal().unwrap();
    port::sleep_for(10);
    // The kill below revoked our ownership while we slept
    assert_eq!(MUTEX.unlock(), Err(UnlockError::NotOwner));
    DONE.signal().unwrap();
}

fn contender(_: usize) {
    assert_eq!(MUTEX.lock(), Err(WaitError::Stopped));
    DONE.signal().unwrap();
}

#[test]
fn kill_revokes_ownership() {
    port::boot(4, || {
        port::spawn(1, holder, 0).unwrap();
        HELD.wait().unwrap();
        port::spawn(2, contender, 0).unwrap();

        // Ownership is discarded and the contender is woken with `Stopped`
        MUTEX.kill();
        for _ in 0..2 {
            DONE.wait().unwrap();
        }

        // The mutex is free and usable after the kill
        assert_eq!(MUTEX.try_lock(), Ok(()));
        MUTEX.unlock().unwrap();
    });
}
