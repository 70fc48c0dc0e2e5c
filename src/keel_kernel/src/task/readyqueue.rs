//! Task ready queue (internal use only)
//!
//! One FIFO list per priority band, plus a bitmap with one bit per band for
//! O(1) lookup of the highest non-empty band.
use core::ops::RangeTo;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{self, ListHead, TaskRef},
    utils::{Init, PrioBitmap},
    KernelTraits, Port, PRIORITY_LEVELS,
};

/// The result type of [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// Do not perform a context switch; continue scheduling the current
    /// task.
    Keep,
    /// Perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// A ready queue tracking the Ready tasks, ordered by priority and FIFO
/// within each priority band.
///
/// Invariant: `bitmap` bit `i` is set iff `queues[i]` is non-empty.
pub(crate) struct ReadyQueue<Traits: Port> {
    bitmap: CpuLockCell<Traits, PrioBitmap>,
    queues: [CpuLockCell<Traits, ListHead>; PRIORITY_LEVELS],
}

impl<Traits: Port> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        bitmap: Init::INIT,
        queues: Init::INIT,
    };
}

impl<Traits: KernelTraits> ReadyQueue<Traits> {
    /// Return a flag indicating whether there's a Ready task whose priority
    /// falls in the specified range.
    pub(crate) fn has_ready_task_in_priority_range(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        range: RangeTo<usize>,
    ) -> bool {
        match self.bitmap.get(&*lock).find_set() {
            Some(priority) => priority < range.end,
            None => false,
        }
    }

    /// Insert the specified task into the ready queue, after all other
    /// tasks of the same priority.
    ///
    /// The caller must ensure the task is not already in any list.
    pub(crate) fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
    ) {
        let priority = task.priority.get(&*lock);
        task::list_push_back(lock.borrow_mut(), &self.queues[priority], task);
        self.bitmap.write(&mut *lock).set(priority);
    }

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// priority of the task that would keep running if this decision did
    /// not request preemption. `usize::MAX` indicates there is no such
    /// task, in which case this method always returns `SwitchTo(_)`.
    ///
    /// Returns `Keep` when the front task's priority does not beat
    /// `prev_task_priority`, i.e., equal-priority tasks do not preempt each
    /// other. If `SwitchTo(Some(task))` is returned, `task` has been
    /// removed from the queue.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: usize,
    ) -> ScheduleDecision<TaskRef<Traits>> {
        let front_priority = match self.bitmap.get(&*lock).find_set() {
            Some(priority) if priority < prev_task_priority => priority,
            Some(_) => return ScheduleDecision::Keep,
            None if prev_task_priority == usize::MAX => return ScheduleDecision::SwitchTo(None),
            None => return ScheduleDecision::Keep,
        };

        debug_assert!(self.bitmap.get(&*lock).get(front_priority));

        let queue = &self.queues[front_priority];
        let task = task::list_pop_front(lock.borrow_mut(), queue);
        debug_assert!(task.is_some());
        if queue.get(&*lock).first.is_none() {
            self.bitmap.write(&mut *lock).clear(front_priority);
        }
        ScheduleDecision::SwitchTo(task)
    }
}
