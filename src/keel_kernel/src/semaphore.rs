//! Counting and binary semaphores
//!
//! The permit count always stays within `0..=limit`. When a waiter is
//! blocked and a permit arrives, the permit is handed to the waiter
//! directly without passing through the count; symmetrically, when a sender
//! is blocked on a full semaphore and a permit is taken, the sender's
//! pending deposit replaces it. Observers reading [`Semaphore::value`]
//! therefore never see a transient out-of-range count.
use core::fmt;

use crate::{
    error::{WaitError, WaitResult},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port, Time32, IMMEDIATE, INFINITE,
};

/// The semaphore permit count representation.
pub type SemaphoreValue = u32;

/// The permit limit of a binary semaphore.
pub const SEM_BINARY: SemaphoreValue = 1;

/// The permit limit of an unbounded counting semaphore.
pub const SEM_COUNTING: SemaphoreValue = SemaphoreValue::MAX;

/// A counting semaphore.
///
/// Waiters are serviced in priority order, FIFO within a priority band.
pub struct Semaphore<Traits: Port> {
    value: CpuLockCell<Traits, SemaphoreValue>,
    limit: SemaphoreValue,
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Semaphore<Traits> {
    /// Construct a semaphore with the given initial permit count and limit.
    /// An initial count above the limit is clamped to the limit.
    ///
    /// `limit` must be non-zero.
    pub const fn new(init: SemaphoreValue, limit: SemaphoreValue) -> Self {
        assert!(limit > 0, "a semaphore must admit at least one permit");
        let value = if init < limit { init } else { limit };
        Self {
            value: CpuLockCell::new(value),
            limit,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }

    /// Construct a binary semaphore.
    pub const fn new_binary(init: SemaphoreValue) -> Self {
        Self::new(init, SEM_BINARY)
    }
}

impl<Traits: Port> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Get the current permit count.
    ///
    /// While one or more senders are blocked, the count reads as `limit`;
    /// their pending deposits are not part of the count.
    pub fn value(&'static self) -> SemaphoreValue {
        let lock = klock::expect_cpu_lock::<Traits>();
        self.value.get(&*lock)
    }

    /// Acquire a permit, waiting indefinitely for one to become available.
    pub fn wait(&'static self) -> WaitResult<()> {
        self.wait_for(INFINITE)
    }

    /// Acquire a permit without waiting. Callable from an interrupt
    /// context.
    pub fn try_wait(&'static self) -> WaitResult<()> {
        self.wait_for(IMMEDIATE)
    }

    /// Acquire a permit, waiting up to `timeout` ticks.
    pub fn wait_for(&'static self, timeout: Time32) -> WaitResult<()> {
        state::assert_waitable::<Traits>(timeout);
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.take(lock.borrow_mut()) {
            // Taking a permit may have readied a blocked sender
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }
        if timeout == IMMEDIATE {
            return Err(WaitError::Timeout);
        }

        let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore, wake_at)
            .map(|_| ())
    }

    /// Acquire a permit, waiting until the point `at` of the tick time
    /// base.
    pub fn wait_until(&'static self, at: Time32) -> WaitResult<()> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.take(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }

        let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore, wake_at)
            .map(|_| ())
    }

    /// Release a permit, waiting indefinitely for room if the count is at
    /// the limit.
    pub fn send(&'static self) -> WaitResult<()> {
        self.send_for(INFINITE)
    }

    /// Release a permit without waiting; fails with `Timeout` if the count
    /// is at the limit. Callable from an interrupt context.
    pub fn signal(&'static self) -> WaitResult<()> {
        self.send_for(IMMEDIATE)
    }

    /// Release a permit, waiting up to `timeout` ticks for room.
    pub fn send_for(&'static self, timeout: Time32) -> WaitResult<()> {
        state::assert_waitable::<Traits>(timeout);
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.give(lock.borrow_mut()) {
            // The deposit may have readied a blocked waiter
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }
        if timeout == IMMEDIATE {
            return Err(WaitError::Timeout);
        }

        let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore, wake_at)
            .map(|_| ())
    }

    /// Release a permit, waiting until the point `at` of the tick time base
    /// for room.
    pub fn send_until(&'static self, at: Time32) -> WaitResult<()> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if self.give(lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
            return Ok(());
        }

        let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
        self.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore, wake_at)
            .map(|_| ())
    }

    /// Reset the semaphore: the permit count becomes zero and every waiting
    /// task (waiters and blocked senders alike) is woken up with
    /// [`WaitError::Stopped`]. The semaphore remains usable afterwards.
    pub fn kill(&'static self) {
        let mut lock = klock::expect_cpu_lock::<Traits>();
        self.value.replace(&mut *lock, 0);
        self.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitError::Stopped));
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    /// Take one permit if any is available. If a sender was blocked, its
    /// pending deposit replaces the permit just taken, so the count is
    /// unchanged in that case.
    fn take(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let value = self.value.get(&*lock);
        if value == 0 {
            return false;
        }

        if let Some(_sender) = self.wait_queue.wake_up_one(lock.borrow_mut()) {
            // Senders only block while the count is at the limit
            debug_assert_eq!(value, self.limit);
        } else {
            self.value.replace(&mut *lock, value - 1);
        }
        true
    }

    /// Deposit one permit if the count is below the limit. If a waiter was
    /// blocked, the permit is handed to it directly and the count is
    /// unchanged.
    fn give(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let value = self.value.get(&*lock);
        if value >= self.limit {
            return false;
        }

        if let Some(_waiter) = self.wait_queue.wake_up_one(lock.borrow_mut()) {
            // Waiters only block while the count is zero
            debug_assert_eq!(value, 0);
        } else {
            self.value.replace(&mut *lock, value + 1);
        }
        true
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Construct a semaphore on the heap, leaked to the `'static` lifetime
    /// required by the blocking operations. Returns `None` if the
    /// allocation fails.
    pub fn create(init: SemaphoreValue, limit: SemaphoreValue) -> Option<&'static Self> {
        crate::leak_object(Self::new(init, limit))
    }

    /// Destroy a semaphore previously returned by [`Semaphore::create`],
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
