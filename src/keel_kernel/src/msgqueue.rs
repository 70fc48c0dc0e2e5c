//! Message queues
//!
//! A bounded ring buffer of `usize` messages with blocking send and receive.
//! When a receiver is already blocked, a sent message is handed to it
//! directly and never enters the ring buffer; when the buffer is full,
//! senders block carrying their message until a receiver makes room. The
//! buffer therefore never holds a message while a receiver is waiting.
use core::fmt;

use crate::{
    error::{WaitError, WaitResult},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, task, timeout,
    wait::{self, QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port, Time32, IMMEDIATE, INFINITE,
};

#[derive(Clone, Copy, Debug)]
struct Ring<const N: usize> {
    data: [usize; N],
    /// Index of the oldest message.
    first: usize,
    count: usize,
}

impl<const N: usize> Ring<N> {
    const fn new() -> Self {
        Self {
            data: [0; N],
            first: 0,
            count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.count == N
    }

    /// Append a message. The caller must check for room first.
    fn push(&mut self, value: usize) {
        debug_assert!(self.count < N);
        self.data[(self.first + self.count) % N] = value;
        self.count += 1;
    }

    /// Remove and return the oldest message, if any.
    fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let value = self.data[self.first];
        self.first = (self.first + 1) % N;
        self.count -= 1;
        Some(value)
    }

    fn clear(&mut self) {
        self.first = 0;
        self.count = 0;
    }
}

/// A message queue holding up to `N` messages.
///
/// Blocked senders and receivers are serviced strictly in arrival order.
/// At any instant the wait queue holds only senders (buffer full) or only
/// receivers (buffer empty), never both.
pub struct MsgQueue<Traits: Port, const N: usize> {
    ring: CpuLockCell<Traits, Ring<N>>,
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port, const N: usize> MsgQueue<Traits, N> {
    /// Construct an empty message queue. `N` must be non-zero.
    pub const fn new() -> Self {
        assert!(N > 0, "a message queue must hold at least one message");
        Self {
            ring: CpuLockCell::new(Ring::new()),
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
        }
    }
}

impl<Traits: Port, const N: usize> fmt::Debug for MsgQueue<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("wait_queue", &self.wait_queue)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits, const N: usize> MsgQueue<Traits, N> {
    /// The number of messages currently held in the ring buffer. Messages
    /// carried by blocked senders are not counted.
    pub fn len(&'static self) -> usize {
        let lock = klock::expect_cpu_lock::<Traits>();
        self.ring.read(&*lock).count
    }

    pub fn is_empty(&'static self) -> bool {
        self.len() == 0
    }

    /// Receive a message, waiting indefinitely for one to arrive.
    pub fn receive(&'static self) -> WaitResult<usize> {
        self.receive_for(INFINITE)
    }

    /// Receive a message without waiting. Callable from an interrupt
    /// context.
    pub fn try_receive(&'static self) -> WaitResult<usize> {
        self.receive_for(IMMEDIATE)
    }

    /// Receive a message, waiting up to `timeout` ticks.
    pub fn receive_for(&'static self, timeout: Time32) -> WaitResult<usize> {
        state::assert_waitable::<Traits>(timeout);
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if let Some(value) = self.pop_and_refill(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(value);
        }
        if timeout == IMMEDIATE {
            return Err(WaitError::Timeout);
        }

        let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
        self.receive_blocking(lock.borrow_mut(), wake_at)
    }

    /// Receive a message, waiting until the point `at` of the tick time
    /// base.
    pub fn receive_until(&'static self, at: Time32) -> WaitResult<usize> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if let Some(value) = self.pop_and_refill(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(value);
        }

        let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
        self.receive_blocking(lock.borrow_mut(), wake_at)
    }

    /// Send a message, waiting indefinitely for room.
    pub fn send(&'static self, value: usize) -> WaitResult<()> {
        self.send_for(value, INFINITE)
    }

    /// Send a message without waiting; fails with `Timeout` if the buffer
    /// is full. Callable from an interrupt context.
    pub fn try_send(&'static self, value: usize) -> WaitResult<()> {
        self.send_for(value, IMMEDIATE)
    }

    /// Send a message, waiting up to `timeout` ticks for room.
    pub fn send_for(&'static self, value: usize, timeout: Time32) -> WaitResult<()> {
        state::assert_waitable::<Traits>(timeout);
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.deliver(lock.borrow_mut(), value) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }
        if timeout == IMMEDIATE {
            return Err(WaitError::Timeout);
        }

        let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::SendPending(value), wake_at)
            .map(|_| ())
    }

    /// Send a message, waiting until the point `at` of the tick time base
    /// for room.
    pub fn send_until(&'static self, value: usize, at: Time32) -> WaitResult<()> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.deliver(lock.borrow_mut(), value) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }

        let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::SendPending(value), wake_at)
            .map(|_| ())
    }

    /// Reset the queue: the ring buffer is emptied and every waiting task
    /// (senders and receivers alike) is woken up with
    /// [`WaitError::Stopped`], each exactly once. The queue remains usable
    /// afterwards.
    pub fn kill(&'static self) {
        let mut lock = klock::expect_cpu_lock::<Traits>();
        self.ring.write(&mut *lock).clear();
        self.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitError::Stopped));
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    /// Pop the oldest buffered message. If a sender was blocked, move its
    /// pending message into the slot just vacated, completing its send.
    fn pop_and_refill(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<usize> {
        let value = self.ring.write(&mut *lock).pop()?;

        if let Some(sender) = self.wait_queue.wake_up_one(lock.borrow_mut()) {
            match wait::payload(lock.borrow_mut(), sender) {
                WaitPayload::SendPending(pending) => {
                    wait::set_payload(lock.borrow_mut(), sender, WaitPayload::None);
                    self.ring.write(&mut *lock).push(pending);
                }
                // The buffer was full, so every waiter is a sender
                _ => unreachable!(),
            }
        }
        Some(value)
    }

    /// Deliver a message if this can be done without blocking: hand it
    /// directly to a blocked receiver, or append it to the ring buffer.
    fn deliver(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, value: usize) -> bool {
        if self.ring.read(&*lock).count == 0 {
            // The buffer is empty, so every waiter is a receiver
            if let Some(receiver) = self.wait_queue.wake_up_one(lock.borrow_mut()) {
                wait::set_payload(
                    lock.borrow_mut(),
                    receiver,
                    WaitPayload::ReceiveSlot(Some(value)),
                );
                return true;
            }
        }
        if !self.ring.read(&*lock).is_full() {
            self.ring.write(&mut *lock).push(value);
            return true;
        }
        false
    }

    fn receive_blocking(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        wake_at: timeout::WakeAt,
    ) -> WaitResult<usize> {
        match self
            .wait_queue
            .wait(lock, WaitPayload::ReceiveSlot(None), wake_at)?
        {
            WaitPayload::ReceiveSlot(Some(value)) => Ok(value),
            // A successful wake-up always carries a delivered message
            _ => unreachable!(),
        }
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits, const N: usize> MsgQueue<Traits, N> {
    /// Construct a message queue on the heap, leaked to the `'static`
    /// lifetime required by the blocking operations. Returns `None` if the
    /// allocation fails.
    pub fn create() -> Option<&'static Self> {
        crate::leak_object(Self::new())
    }

    /// Destroy a message queue previously returned by [`MsgQueue::create`],
    /// waking any remaining waiters with [`WaitError::Stopped`].
    ///
    /// # Safety
    ///
    /// No reference to `self` may be used after this call, and no task may
    /// be in the middle of an operation on it.
    pub unsafe fn delete(&'static self) {
        self.kill();
        // Safety: forwarded to the caller
        unsafe { crate::release_object(self) };
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    /// Replay `ops` against both the ring and a `VecDeque` model: `Some(v)`
    /// enqueues unless full, `None` dequeues. The two must agree on every
    /// dequeued value and on the message count after every step.
    fn agrees_with_deque<const N: usize>(ops: &[Option<u8>]) -> bool {
        let mut ring = Ring::<N>::new();
        let mut model = VecDeque::new();

        for &op in ops {
            match op {
                Some(v) => {
                    if !ring.is_full() {
                        ring.push(v as usize);
                        model.push_back(v as usize);
                    }
                }
                None => {
                    if ring.pop() != model.pop_front() {
                        return false;
                    }
                }
            }
            if ring.count != model.len() || ring.count > N {
                return false;
            }
        }
        true
    }

    #[quickcheck]
    fn ring_matches_a_deque(ops: Vec<Option<u8>>) -> bool {
        agrees_with_deque::<1>(&ops) && agrees_with_deque::<4>(&ops) && agrees_with_deque::<7>(&ops)
    }

    #[quickcheck]
    fn ring_round_trips_in_order(values: Vec<usize>) -> bool {
        let mut ring = Ring::<8>::new();
        let values = &values[..values.len().min(8)];
        for &v in values {
            ring.push(v);
        }
        values.iter().all(|&v| ring.pop() == Some(v)) && ring.pop().is_none()
    }

    #[quickcheck]
    fn ring_clear_empties(values: Vec<usize>) -> bool {
        let mut ring = Ring::<4>::new();
        for &v in values.iter().take(4) {
            ring.push(v);
        }
        ring.clear();
        ring.count == 0 && ring.pop().is_none()
    }
}
