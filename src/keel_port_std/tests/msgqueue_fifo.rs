use keel_port_std as port;
use port::{MsgQueue, Semaphore, WaitError};
use std::sync::Mutex as StdMutex;

static QUEUE: MsgQueue<2> = MsgQueue::new();
static DONE: Semaphore = Semaphore::new(0, 4);
static ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn receiver(id: usize) {
    let value = QUEUE.receive().unwrap();
    ORDER.lock().unwrap().push(id * 100 + value);
    DONE.signal().unwrap();
}

fn sender(value: usize) {
    QUEUE.send(value).unwrap();
    DONE.signal().unwrap();
}

#[test]
fn message_queue_fifo_handoff() {
    port::boot(4, || {
        // The receivers arrive in spawn order with deliberately shuffled
        // priorities; handoff must follow arrival order, not priority
        port::spawn(3, receiver, 1).unwrap();
        port::spawn(1, receiver, 2).unwrap();
        port::spawn(2, receiver, 3).unwrap();
        assert!(QUEUE.is_empty());

        QUEUE.send(10).unwrap();
        QUEUE.send(20).unwrap();
        QUEUE.send(30).unwrap();
        // Every message went to a blocked receiver, bypassing the buffer
        assert!(QUEUE.is_empty());
        for _ in 0..3 {
            DONE.wait().unwrap();
        }
        assert_eq!(*ORDER.lock().unwrap(), vec![110, 220, 330]);

        // Buffering and a blocked sender
        QUEUE.send(1).unwrap();
        QUEUE.send(2).unwrap();
        assert_eq!(QUEUE.len(), 2);
        assert_eq!(QUEUE.try_send(3), Err(WaitError::Timeout));

        port::spawn(2, sender, 3).unwrap();
        // The sender is blocked; its value is not part of the buffer yet
        assert_eq!(QUEUE.len(), 2);
        // Taking a message opens a slot and completes the blocked send
        assert_eq!(QUEUE.receive(), Ok(1));
        DONE.wait().unwrap();
        assert_eq!(QUEUE.len(), 2);
        assert_eq!(QUEUE.receive(), Ok(2));
        assert_eq!(QUEUE.receive(), Ok(3));

        // Kill discards buffered messages and leaves the queue usable
        QUEUE.send(7).unwrap();
        QUEUE.kill();
        assert!(QUEUE.is_empty());
        assert_eq!(QUEUE.try_receive(), Err(WaitError::Timeout));
        QUEUE.send(8).unwrap();
        assert_eq!(QUEUE.receive(), Ok(8));
    });
}
