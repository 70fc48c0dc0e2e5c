//! Recursive mutexes
//!
//! Ownership-tracked locks with recursive acquisition. There is no priority
//! inheritance: a high-priority task blocking on a mutex held by a
//! low-priority task waits until the owner runs and releases it.
//!
//! All mutex operations require a task context, since ownership is defined
//! in terms of the calling task.
use core::fmt;

use crate::{
    error::{UnlockError, WaitError, WaitResult},
    klock::{self, CpuLockCell},
    state,
    task::{self, TaskRef},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelTraits, Port, Time32, IMMEDIATE, INFINITE,
};

/// A recursive mutex.
///
/// Contending tasks are serviced in priority order, FIFO within a priority
/// band.
pub struct Mutex<Traits: Port> {
    owner: CpuLockCell<Traits, Option<TaskRef<Traits>>>,
    /// Recursion depth minus one while the mutex is owned.
    count: CpuLockCell<Traits, usize>,
    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Mutex<Traits> {
    pub const fn new() -> Self {
        Self {
            owner: CpuLockCell::new(None),
            count: CpuLockCell::new(0),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: Port> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the mutex, waiting indefinitely for it to be released.
    pub fn lock(&'static self) -> WaitResult<()> {
        self.lock_for(INFINITE)
    }

    /// Acquire the mutex without waiting.
    pub fn try_lock(&'static self) -> WaitResult<()> {
        self.lock_for(IMMEDIATE)
    }

    /// Acquire the mutex, waiting up to `timeout` ticks.
    ///
    /// Acquiring a mutex the calling task already owns succeeds
    /// immediately; the mutex must then be released once for each
    /// acquisition.
    pub fn lock_for(&'static self, timeout: Time32) -> WaitResult<()> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        let current = match Traits::state().running_task(lock.borrow_mut()) {
            Some(task) => task,
            None => panic!("no running task"),
        };

        match self.owner.get(&*lock) {
            None => {
                self.owner.replace(&mut *lock, Some(current));
                Ok(())
            }
            Some(owner) if owner as *const _ == current as *const _ => {
                self.count.replace_with(&mut *lock, |c| *c + 1);
                Ok(())
            }
            Some(_) => {
                if timeout == IMMEDIATE {
                    return Err(WaitError::Timeout);
                }
                let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), timeout);
                // On success the releasing task has made us the owner
                self.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::Mutex, wake_at)
                    .map(|_| ())
            }
        }
    }

    /// Acquire the mutex, waiting until the point `at` of the tick time
    /// base.
    pub fn lock_until(&'static self, at: Time32) -> WaitResult<()> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        let current = match Traits::state().running_task(lock.borrow_mut()) {
            Some(task) => task,
            None => panic!("no running task"),
        };

        match self.owner.get(&*lock) {
            None => {
                self.owner.replace(&mut *lock, Some(current));
                Ok(())
            }
            Some(owner) if owner as *const _ == current as *const _ => {
                self.count.replace_with(&mut *lock, |c| *c + 1);
                Ok(())
            }
            Some(_) => {
                let wake_at = timeout::wake_at_point::<Traits>(lock.borrow_mut(), at)?;
                self.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::Mutex, wake_at)
                    .map(|_| ())
            }
        }
    }

    /// Release the mutex. Fails with [`UnlockError::NotOwner`] if the
    /// calling task does not own it, which also happens when the mutex was
    /// killed while the caller held it.
    ///
    /// When the outermost acquisition is released, ownership passes to the
    /// frontmost waiting task, if any.
    pub fn unlock(&'static self) -> Result<(), UnlockError> {
        state::assert_task_context::<Traits>();
        let mut lock = klock::expect_cpu_lock::<Traits>();

        let current = match Traits::state().running_task(lock.borrow_mut()) {
            Some(task) => task,
            None => panic!("no running task"),
        };
        let owner = self.owner.get(&*lock);
        if !matches!(owner, Some(owner) if owner as *const _ == current as *const _) {
            return Err(UnlockError::NotOwner);
        }

        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        // Hand ownership to the next contender, if any
        let next = self.wait_queue.wake_up_one(lock.borrow_mut());
        self.owner.replace(&mut *lock, next);
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
        Ok(())
    }

    /// Reset the mutex: ownership is discarded and every waiting task is
    /// woken up with [`WaitError::Stopped`]. The mutex remains usable
    /// afterwards.
    pub fn kill(&'static self) {
        let mut lock = klock::expect_cpu_lock::<Traits>();
        self.owner.replace(&mut *lock, None);
        self.count.replace(&mut *lock, 0);
        self.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitError::Stopped));
        task::unlock_cpu_and_check_preemption::<Traits>(lock);
    }
}

#[cfg(feature = "alloc")]
impl<Traits: KernelTraits> Mutex<Traits> {
    /// Construct a mutex on the heap, leaked to the `'static` lifetime
    /// required by the blocking operations. Returns `None` if the
    /// allocation fails.
    pub fn create() -> Option<&'static Self> {
        crate::leak_object(Self::new())
    }

    /// Destroy a mutex previously returned by [`Mutex::create`], waking any
    /// remaining waiters with [`WaitError::Stopped`].
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
