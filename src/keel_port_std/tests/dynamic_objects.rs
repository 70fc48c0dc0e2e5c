use keel_port_std as port;
use port::{EventFlag, EventFlagWaitFlags, MsgQueue, Mutex, Semaphore};

#[test]
fn heap_allocated_objects() {
    port::boot(4, || {
        let sem = Semaphore::create(1, 1).unwrap();
        assert_eq!(sem.try_wait(), Ok(()));
        sem.signal().unwrap();
        // Safety: no task is waiting on the semaphore
        unsafe { sem.delete() };

        let queue = MsgQueue::<4>::create().unwrap();
        queue.send(5).unwrap();
        assert_eq!(queue.receive(), Ok(5));
        // Safety: no task is waiting on the queue
        unsafe { queue.delete() };

        let flag = EventFlag::create(0b1).unwrap();
        assert_eq!(flag.try_wait(0b1, EventFlagWaitFlags::empty()), Ok(0b1));
        // Safety: no task is waiting on the flag
        unsafe { flag.delete() };

        let mutex = Mutex::create().unwrap();
        mutex.lock().unwrap();
        mutex.unlock().unwrap();
        // Safety: the mutex is unowned and has no waiters
        unsafe { mutex.delete() };
    });
}
