use keel_port_std as port;
use port::Semaphore;
use std::sync::Mutex as StdMutex;

static SEM: Semaphore = Semaphore::new_binary(0);
static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn waiter(_: usize) {
    SEM.wait().unwrap();
    ORDER.lock().unwrap().push(1);
}

#[test]
fn interrupt_signal_pends_the_switch() {
    port::boot(4, || {
        // Preempts us and blocks on the semaphore
        port::spawn(2, waiter, 0).unwrap();

        port::with_interrupt_context(|| {
            // Wakes the higher-priority waiter, but the handler keeps
            // running; the context switch is taken on interrupt return
            SEM.signal().unwrap();
            ORDER.lock().unwrap().push(0);
        });

        assert_eq!(*ORDER.lock().unwrap(), vec![0, 1]);
    });
}
