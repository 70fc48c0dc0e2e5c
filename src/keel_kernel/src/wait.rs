//! The generic wait/wake-up protocol
//!
//! Every blocking primitive is built on [`WaitQueue`]: a blocking operation
//! parks the current task on the object's queue together with a
//! [`WaitPayload`], and an unblocking operation (a wake-up, a timeout
//! expiry, or a `kill`) removes it, records the outcome in the task's
//! control block, and makes the task Ready again. Payloads let the waker
//! hand a value directly to the sleeper while both are frozen under CPU
//! Lock.
use core::fmt;

use crate::{
    error::{WaitError, WaitResult},
    eventflag::{EventFlagBits, EventFlagWaitFlags},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{self, ListHead, TaskRef, TaskSt},
    timeout::{self, WakeAt},
    utils::Init,
    KernelTraits, Port,
};

/// Ordering of tasks within a [`WaitQueue`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order, FIFO among
    /// tasks of the same priority.
    TaskPriority,
}

/// Operation-specific state carried by a waiting task, used to transfer
/// values between the waker and the sleeper.
#[derive(Clone, Copy, Debug)]
pub(crate) enum WaitPayload {
    None,
    /// Waiting in `sleep_for` or `sleep_until`; not attached to any queue.
    Sleep,
    /// Waiting to acquire a semaphore permit, or to deposit one into a full
    /// semaphore.
    Semaphore,
    /// A value waiting to be moved into a full message queue's ring buffer.
    SendPending(usize),
    /// A slot for a value delivered directly to a blocked receiver,
    /// bypassing the ring buffer.
    ReceiveSlot(Option<usize>),
    /// An event-flag wait condition. On wake-up, `orig` holds the flag
    /// state that fulfilled the condition.
    EventFlag {
        bits: EventFlagBits,
        flags: EventFlagWaitFlags,
        orig: EventFlagBits,
    },
    /// Waiting to acquire a mutex.
    Mutex,
}

impl Init for WaitPayload {
    const INIT: Self = Self::None;
}

/// The wait-related fields of a task control block.
pub(crate) struct TaskWait<Traits: Port> {
    /// The wait queue the task is currently waiting on, if any. `Sleep`
    /// waits have a payload but no queue.
    current_queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,

    /// The result of the last wait operation, written by whoever wakes the
    /// task up.
    wait_result: CpuLockCell<Traits, WaitResult<()>>,

    payload: CpuLockCell<Traits, WaitPayload>,
}

impl<Traits: Port> Init for TaskWait<Traits> {
    const INIT: Self = Self {
        current_queue: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
        payload: Init::INIT,
    };
}

impl<Traits: Port> TaskWait<Traits> {
    /// Reset the wait state when the containing control block is recycled.
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.current_queue.replace(&mut *lock, None);
        let _ = self.wait_result.replace(&mut *lock, Ok(()));
        self.payload.replace(&mut *lock, WaitPayload::None);
    }
}

impl<Traits: Port> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// A queue of tasks waiting on a kernel object.
pub(crate) struct WaitQueue<Traits: Port> {
    waits: CpuLockCell<Traits, ListHead>,
    order: QueueOrder,
}

impl<Traits: Port> WaitQueue<Traits> {
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(ListHead {
                first: None,
                last: None,
            }),
            order,
        }
    }
}

impl<Traits: Port> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waits", &self.waits)
            .field("order", &self.order)
            .finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Park the current task on `self` until it is woken up or `wake_at` is
    /// reached. Returns the task's final payload on success, letting the
    /// caller retrieve a value deposited by the waker.
    pub(crate) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload,
        wake_at: WakeAt,
    ) -> WaitResult<WaitPayload> {
        let task = match Traits::state().running_task(lock.borrow_mut()) {
            Some(task) => task,
            None => panic!("no running task"),
        };

        task.wait.current_queue.replace(&mut *lock, Some(self));
        let _ = task.wait.wait_result.replace(&mut *lock, Ok(()));
        task.wait.payload.replace(&mut *lock, payload);

        match self.order {
            QueueOrder::Fifo => task::list_push_back(lock.borrow_mut(), &self.waits, task),
            QueueOrder::TaskPriority => {
                task::list_insert_priority(lock.borrow_mut(), &self.waits, task)
            }
        }

        timeout::arm(lock.borrow_mut(), task, wake_at);
        task::wait_until_woken_up(lock.borrow_mut());

        task.wait
            .wait_result
            .get(&*lock)
            .map(|()| task.wait.payload.get(&*lock))
    }

    /// Wake up the task at the front of the queue with a successful result.
    /// Returns the woken task so the caller can transfer a payload to or
    /// from it; the task cannot run before the caller releases CPU Lock.
    pub(crate) fn wake_up_one(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        let task = task::list_pop_front(lock.borrow_mut(), &self.waits)?;
        complete_wait(lock, task, Ok(()));
        Some(task)
    }

    /// Wake up all waiting tasks with the specified result. Returns the
    /// number of woken tasks.
    pub(crate) fn wake_up_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        result: WaitResult<()>,
    ) -> usize {
        let mut count = 0;
        while let Some(task) = task::list_pop_front(lock.borrow_mut(), &self.waits) {
            complete_wait(lock.borrow_mut(), task, result);
            count += 1;
        }
        count
    }

    /// Wake up the waiting tasks selected by `cond`, with a successful
    /// result, preserving the queue order among the rest.
    ///
    /// `cond` receives each task's payload and may update it; the updated
    /// payload is what the woken task observes. Returns the number of woken
    /// tasks.
    pub(crate) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&mut WaitPayload) -> bool,
    ) -> usize {
        let mut count = 0;
        let mut cursor = self.waits.get(&*lock).first;
        while let Some(i) = cursor {
            let task = task::task_by_index::<Traits>(i);
            // Read the successor before a potential unlink
            cursor = match task.link.get(&*lock) {
                Some(link) => link.next,
                None => panic!("task list corrupted"),
            };

            let mut payload = task.wait.payload.get(&*lock);
            if cond(&mut payload) {
                task.wait.payload.replace(&mut *lock, payload);
                task::list_remove(lock.borrow_mut(), &self.waits, task);
                complete_wait(lock.borrow_mut(), task, Ok(()));
                count += 1;
            }
        }
        count
    }
}

/// Park the current task without attaching it to any wait queue. Only the
/// time base can wake it up.
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload,
    wake_at: WakeAt,
) -> WaitResult<WaitPayload> {
    let task = match Traits::state().running_task(lock.borrow_mut()) {
        Some(task) => task,
        None => panic!("no running task"),
    };

    task.wait.current_queue.replace(&mut *lock, None);
    let _ = task.wait.wait_result.replace(&mut *lock, Ok(()));
    task.wait.payload.replace(&mut *lock, payload);

    timeout::arm(lock.borrow_mut(), task, wake_at);
    task::wait_until_woken_up(lock.borrow_mut());

    task.wait
        .wait_result
        .get(&*lock)
        .map(|()| task.wait.payload.get(&*lock))
}

/// Record the outcome of a wait and make the task Ready again.
///
/// The task must already be detached from its wait queue.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    result: WaitResult<()>,
) {
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Waiting);
    debug_assert!(task.link.get(&*lock).is_none());

    task.wait.current_queue.replace(&mut *lock, None);
    let _ = task.wait.wait_result.replace(&mut *lock, result);
    timeout::disarm(lock.borrow_mut(), task);

    // Safety: the task has been detached from its wait queue
    unsafe { task::make_ready(lock, task) };
}

/// Wake up `task` with a `Timeout` result after its deadline passed. Called
/// by the time base, which has already removed the task's timeout entry.
pub(crate) fn expire_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if let Some(queue) = task.wait.current_queue.get(&*lock) {
        task::list_remove(lock.borrow_mut(), &queue.waits, task);
    }
    complete_wait(lock, task, Err(WaitError::Timeout));
}

/// Overwrite the payload slot of a woken task. Used by wakers that deposit a
/// value after calling [`WaitQueue::wake_up_one`].
pub(crate) fn set_payload<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    payload: WaitPayload,
) {
    task.wait.payload.replace(&mut *lock, payload);
}

/// Read a woken task's payload, e.g., to collect a value it was carrying.
pub(crate) fn payload<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) -> WaitPayload {
    task.wait.payload.get(&*lock)
}
