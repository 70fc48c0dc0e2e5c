use keel_port_std as port;
use port::{Mutex, Semaphore, WaitError};
use std::sync::Mutex as StdMutex;

static MUTEX: Mutex = Mutex::new();
static DONE: Semaphore = Semaphore::new(0, 4);
static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn contender(id: usize) {
    MUTEX.lock().unwrap();
    ORDER.lock().unwrap().push(id);
    MUTEX.unlock().unwrap();
    DONE.signal().unwrap();
}

fn holder(_: usize) {
    MUTEX.lock().unwrap();
    port::sleep_for(10);
    MUTEX.unlock().unwrap();
    DONE.signal().unwrap();
}

#[test]
fn mutex_ownership_and_recursion() {
    port::boot(4, || {
        // Recursive locking by the owner; the mutex is released only by the
        // outermost unlock
        MUTEX.lock().unwrap();
        MUTEX.lock().unwrap();
        assert_eq!(MUTEX.try_lock(), Ok(()));
        MUTEX.unlock().unwrap();
        MUTEX.unlock().unwrap();

        port::spawn(2, contender, 1).unwrap();
        port::spawn(1, contender, 2).unwrap();
        // Both contenders are blocked; we still own the mutex
        assert!(ORDER.lock().unwrap().is_empty());

        // The final unlock hands ownership to the highest-priority waiter
        MUTEX.unlock().unwrap();
        for _ in 0..2 {
            DONE.wait().unwrap();
        }
        assert_eq!(*ORDER.lock().unwrap(), vec![2, 1]);

        // Free again after the contenders released it
        assert_eq!(MUTEX.try_lock(), Ok(()));
        MUTEX.unlock().unwrap();

        // A timed lock against another owner expires
        port::spawn(1, holder, 0).unwrap();
        assert_eq!(MUTEX.lock_for(3), Err(WaitError::Timeout));
        assert_eq!(MUTEX.lock(), Ok(()));
        MUTEX.unlock().unwrap();
        DONE.wait().unwrap();
    });
}
