use keel_port_std as port;
use port::Semaphore;
use std::sync::Mutex as StdMutex;

static SEM: Semaphore = Semaphore::new_binary(0);
static DONE: Semaphore = Semaphore::new(0, 3);
static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn waiter(id: usize) {
    assert_eq!(SEM.wait(), Ok(()));
    ORDER.lock().unwrap().push(id);
    DONE.signal().unwrap();
}

#[test]
fn binary_semaphore_direct_handoff() {
    port::boot(4, || {
        // Each spawn preempts us; the waiter blocks before `spawn` returns
        port::spawn(3, waiter, 3).unwrap();
        port::spawn(1, waiter, 1).unwrap();
        port::spawn(2, waiter, 2).unwrap();
        assert!(ORDER.lock().unwrap().is_empty());

        for _ in 0..3 {
            SEM.signal().unwrap();
            // The permit was handed to a waiter directly, never deposited
            assert_eq!(SEM.value(), 0);
        }
        for _ in 0..3 {
            DONE.wait().unwrap();
        }

        // Waiters are released in priority order, not arrival order
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2, 3]);
    });
}
