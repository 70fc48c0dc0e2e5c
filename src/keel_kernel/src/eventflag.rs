//! Event flags
//!
//! A 32-bit flag word tasks can wait on. A waiter names the bits it is
//! interested in and whether it needs all of them or any one; a setter
//! wakes every waiter whose condition just became fulfilled.
use core::fmt;

use crate::{
    error::{WaitError, WaitResult},
    klock::{self, CpuLockCell},
    state, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port, Time32, IMMEDIATE, INFINITE,
};

/// The bit-flag word of an [`EventFlag`].
pub type EventFlagBits = u32;

bitflags::bitflags! {
    /// Options for the `wait` family of [`EventFlag`] operations.
    pub struct EventFlagWaitFlags: u8 {
        /// Wait until all of the specified bits are set, instead of any
        /// one of them.
        const ALL = 1 << 0;
        /// Clear the specified bits when the wait condition is fulfilled.
        const CLEAR = 1 << 1;
    }
}

/// A set of event flags.
///
/// Waiters are serviced in priority order, FIFO within a priority band.
pub struct EventFlag<Traits: Port> {
    bits: CpuLockCell<Traits, EventFlagBits>,
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> EventFlag<Traits> {
    pub const fn new(init: EventFlagBits) -> Self {
        Self {
            bits: CpuLockCell::new(init),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: Port> fmt::Debug for EventFlag<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFlag")
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

/// Given a wait condition `(bits, flags)`, check if the current flag word
/// `current` satisfies it. On success, clear bits from `current` if
/// requested and return the original word.
fn poll_core(
    current: &mut EventFlagBits,
    bits: EventFlagBits,
    flags: EventFlagWaitFlags,
) -> Option<EventFlagBits> {
    let fulfilled = if flags.contains(EventFlagWaitFlags::ALL) {
        (*current & bits) == bits
    } else {
        (*current & bits) != 0
    };

    if fulfilled {
        let original = *current;
        if flags.contains(EventFlagWaitFlags::CLEAR) {
            *current &= !bits;
        }
        Some(original)
    } else {
        None
    }
}

impl<Traits: KernelTraits> EventFlag<Traits> {
    /// Get the current flag word.
    pub fn get(&'static self) -> EventFlagBits {
        let lock = klock::expect_cpu_lock::<Traits>();
        self.bits.get(&*lock)
    }

    /// Clear the specified bits. Callable from an interrupt context.
    pub fn clear(&'static self, bits: EventFlagBits) {
        let mut lock = klock::expect_cpu_lock::<Traits>();
        self.bits.replace_with(&mut *lock, |b| *b & !bits);
    }

    /// Set the specified bits and wake every waiter whose condition is now
    /// fulfilled. Callable from an interrupt context.
    pub fn set(&'static self, bits: EventFlagBits) {
        let mut lock = klock::expect_cpu_lock::<Traits>();

        let mut current = self.bits.get(&*lock) | bits;

        // Waiters are examined in queue order; an earlier waiter with
        // `CLEAR` can consume bits a later waiter was also waiting for.
        let woken = self
            .wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload| match payload {
                WaitPayload::EventFlag { bits, flags, orig } => {
                    if let Some(original) = poll_core(&mut current, *bits, *flags) {
                        *orig = original;
                        true
                    } else {
                        false
                    }
                }
                _ => unreachable!(),
            });

        self.bits.replace(&mut *lock, current);

        if woken > 0 {
            task::unlock_cpu_and_check_preemption::<Traits>(lock);
        }
    }

    /// Wait indefinitely until the specified bits are set. Returns the flag
    /// word that fulfilled the condition.
    pub fn wait(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
    ) -> WaitResult<EventFlagBits> {
        self.wait_for(bits, flags, INFINITE)
    }

    /// Check the condition without waiting. Callable from an interrupt
    /// context.
    pub fn try_wait(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
    ) -> WaitResult<EventFlagBits> {
        self.wait_for(bits, flags, IMMEDIATE)
    }

    /// Wait up to `timeout` ticks until the specified bits are set.
    pub fn wait_for(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
        timeout: Time32,
    ) -> WaitResult<EventFlagBits> {
        state::assert_waitable::<Traits>(timeout);
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if let Some(original) = poll_core(self.bits.write(&mut *lock), bits, flags) {
            return Ok(original);
        }
        if timeout == IMMEDIATE {
            return Err(WaitError::Timeout);
        }

        let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
        self.wait_blocking(lock.borrow_mut(), bits, flags, wake_at)
    }

    /// Wait until the point `at` of the tick time base for the specified
    /// bits to be set.
    pub fn wait_until(
        &'static self,
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
        at: Time32,
    ) -> WaitResult<EventFlagBits> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        if let Some(original) = poll_core(self.bits.write(&mut *lock), bits, flags) {
            return Ok(original);
        }

        let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
        self.wait_blocking(lock.borrow_mut(), bits, flags, wake_at)
    }

    /// Reset the flag word to zero and wake every waiter with
    /// [`WaitError::Stopped`]. The object remains usable afterwards.
    pub fn kill(&'static self) {
        let mut lock = klock::expect_cpu_lock::<Traits>();
        self.bits.replace(&mut *lock, 0);
        self.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitError::Stopped));
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }

    fn wait_blocking(
        &'static self,
        lock: crate::klock::CpuLockTokenRefMut<'_, Traits>,
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
        wake_at: timeout::WakeAt,
    ) -> WaitResult<EventFlagBits> {
        let payload = WaitPayload::EventFlag {
            bits,
            flags,
            orig: 0,
        };
        match self.wait_queue.wait(lock, payload, wake_at)? {
            // The fulfilling flag word was stored by the setter
            WaitPayload::EventFlag { orig, .. } => Ok(orig),
            _ => unreachable!(),
        }
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> EventFlag<Traits> {
    /// Construct an event flag object on the heap, leaked to the `'static`
    /// lifetime required by the blocking operations. Returns `None` if the
    /// allocation fails.
    pub fn create(init: EventFlagBits) -> Option<&'static Self> {
        crate::leak_object(Self::new(init))
    }

    /// Destroy an event flag object previously returned by
    /// [`EventFlag::create`], waking any remaining waiters with
    /// [`WaitError::Stopped`].
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
