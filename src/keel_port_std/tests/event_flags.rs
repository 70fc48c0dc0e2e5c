use keel_port_std as port;
use port::{EventFlag, EventFlagWaitFlags, Semaphore, WaitError};

static FLAG: EventFlag = EventFlag::new(0);
static DONE: Semaphore = Semaphore::new(0, 4);

fn wait_all_clear(_: usize) {
    let orig = FLAG
        .wait(0b11, EventFlagWaitFlags::ALL | EventFlagWaitFlags::CLEAR)
        .unwrap();
    assert_eq!(orig & 0b11, 0b11);
    DONE.signal().unwrap();
}

fn wait_any(_: usize) {
    let orig = FLAG.wait(0b100, EventFlagWaitFlags::empty()).unwrap();
    assert_ne!(orig & 0b100, 0);
    DONE.signal().unwrap();
}

fn wait_stopped(_: usize) {
    assert_eq!(
        FLAG.wait(0b1_0000, EventFlagWaitFlags::empty()),
        Err(WaitError::Stopped)
    );
    DONE.signal().unwrap();
}

#[test]
fn event_flag_conditions() {
    port::boot(4, || {
        // Already-set bits satisfy a poll; without CLEAR they stay set
        FLAG.set(0b1000);
        assert_eq!(
            FLAG.try_wait(0b1000, EventFlagWaitFlags::empty()),
            Ok(0b1000)
        );
        assert_eq!(FLAG.get(), 0b1000);
        FLAG.clear(0b1000);
        assert_eq!(FLAG.get(), 0);

        // ALL requires every requested bit; CLEAR consumes them on wakeup
        port::spawn(2, wait_all_clear, 0).unwrap();
        FLAG.set(0b01);
        assert_eq!(FLAG.get(), 0b01);
        FLAG.set(0b10);
        DONE.wait().unwrap();
        assert_eq!(FLAG.get(), 0);

        // ANY fires on any requested bit and leaves the word untouched
        port::spawn(2, wait_any, 0).unwrap();
        FLAG.set(0b100);
        DONE.wait().unwrap();
        assert_eq!(FLAG.get(), 0b100);
        FLAG.clear(0b100);

        // A timed wait on unset bits expires
        assert_eq!(
            FLAG.wait_for(0b1_0000, EventFlagWaitFlags::empty(), 5),
            Err(WaitError::Timeout)
        );

        // Kill zeroes the word and wakes waiters with Stopped
        port::spawn(2, wait_stopped, 0).unwrap();
        FLAG.set(0b1);
        FLAG.kill();
        DONE.wait().unwrap();
        assert_eq!(FLAG.get(), 0);
    });
}
