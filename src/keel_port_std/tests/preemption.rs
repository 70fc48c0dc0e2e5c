use keel_port_std as port;
use std::sync::Mutex as StdMutex;

static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn mark(value: usize) {
    ORDER.lock().unwrap().push(value);
}

fn peer(id: usize) {
    mark(id);
    port::yield_now();
    mark(id + 10);
}

fn high(_: usize) {
    mark(99);
}

#[test]
fn preemption_and_round_robin() {
    port::boot(4, || {
        // An equal-priority spawn never preempts the running task
        port::spawn(4, peer, 1).unwrap();
        mark(100);

        // A strictly higher-priority spawn preempts before `spawn` returns.
        // The preempted task goes to the back of its priority band, so once
        // `high` exits, `peer` runs first.
        port::spawn(3, high, 0).unwrap();
        mark(101);

        // `yield_now` hands the processor to the equal-priority peer
        port::yield_now();
        mark(102);

        assert_eq!(*ORDER.lock().unwrap(), vec![100, 99, 1, 101, 11, 102]);
    });
}
