//! The Keel kernel: a preemptible, priority-based real-time kernel core.
//!
//! This crate contains the target-independent part of the kernel: the
//! scheduler, the tick time base, and the synchronization primitives
//! (semaphores, message queues, event flags, and mutexes). Everything
//! target-specific is abstracted behind the [`Port`] trait, which a port
//! crate implements for a system type of its choice.
//!
//! # Scheduling model
//!
//! The scheduler always runs the ready task with the highest priority
//! (numerically lowest [`Priority`] value). Tasks of equal priority run in
//! FIFO order and are never preempted by each other; preemption happens only
//! when a strictly higher-priority task becomes ready. There is no time
//! slicing.
//!
//! # Contexts
//!
//! Kernel entry points are reached with CPU Lock inactive. Operations that
//! can block may only be called from a task context; the non-blocking
//! variants (`try_*`, `signal`, `set`, ...) may additionally be called from
//! an interrupt context as defined by the port.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "alloc")]
extern crate alloc;

use core::fmt;

mod klock;
pub mod utils;

pub mod error;
pub mod eventflag;
pub mod msgqueue;
pub mod mutex;
pub mod semaphore;
mod state;
pub mod task;
pub mod timeout;
mod wait;

pub use self::{
    error::{UnlockError, WaitError, WaitResult},
    eventflag::{EventFlag, EventFlagBits, EventFlagWaitFlags},
    msgqueue::MsgQueue,
    mutex::Mutex,
    semaphore::{Semaphore, SemaphoreValue, SEM_BINARY, SEM_COUNTING},
    state::State,
    task::{exit_task, sleep_for, sleep_until, spawn, yield_now, Task, TaskAttr, TaskCb, TaskRef},
    timeout::{tick_count, Time32, DURATION_MAX, IMMEDIATE, INFINITE},
};
use self::utils::Init;

/// Move a kernel object to the heap and leak it, giving it the `'static`
/// lifetime that blocking operations require.
#[cfg(feature = "alloc")]
pub(crate) fn leak_object<T>(x: T) -> Option<&'static T> {
    use alloc::alloc::{alloc as raw_alloc, Layout};
    let layout = Layout::new::<T>();
    // Safety: every kernel object type has a non-zero size
    unsafe {
        let ptr = raw_alloc(layout).cast::<T>();
        if ptr.is_null() {
            None
        } else {
            ptr.write(x);
            Some(&*ptr)
        }
    }
}

/// Reverse of [`leak_object`].
///
/// # Safety
///
/// `x` must have been returned by [`leak_object`], and no reference to it
/// may be used afterwards.
#[cfg(feature = "alloc")]
pub(crate) unsafe fn release_object<T>(x: &'static T) {
    use alloc::alloc::{dealloc, Layout};
    let ptr = x as *const T as *mut T;
    // Safety: forwarded to the caller
    unsafe {
        core::ptr::drop_in_place(ptr);
        dealloc(ptr.cast(), Layout::new::<T>());
    }
}

/// The number of task control blocks provided by the kernel. Attempting to
/// have more than this many live tasks makes [`spawn`] fail.
pub const NUM_TASKS: usize = 32;

/// The number of priority bands. Valid [`Priority`] values are
/// `0..PRIORITY_LEVELS`, with `0` being the highest priority.
pub const PRIORITY_LEVELS: usize = 16;

const _: () = assert!(PRIORITY_LEVELS <= usize::BITS as usize);

/// Task priority. Numerically lower values are scheduled first.
pub type Priority = usize;

/// Implemented by a port on its system type to provide the target-specific
/// parts of the kernel: CPU Lock, context queries, and thread management.
///
/// # Safety
///
/// Implementing this trait is `unsafe` in spirit: the kernel's soundness
/// rests on the implementation following each method's contract. The methods
/// themselves are `unsafe fn`s because they are only meant to be called by
/// the kernel.
pub trait Port: Sized + 'static {
    /// The port-specific part of a task control block. For a hosted port
    /// this typically identifies the thread backing the task.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// Enter a CPU Lock state if it is currently inactive. Return `true` on
    /// success.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter a CPU Lock state, blocking until it can be acquired.
    unsafe fn enter_cpu_lock();

    /// Leave a CPU Lock state.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the calling context is a task
    /// context, in which blocking operations are allowed.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the calling context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// Prepare the execution context for a newly spawned task. The task
    /// starts running `attr.entry` no sooner than the next time the
    /// scheduler selects it.
    ///
    /// # Safety
    ///
    /// Called by the kernel with CPU Lock active, exactly once for each
    /// successful [`spawn`].
    unsafe fn initialize_task_state(task: TaskRef<Self>, attr: TaskAttr);

    /// Dispose of the execution context of the calling task and switch to
    /// the next scheduled task. The kernel has already detached `task` from
    /// all scheduling structures.
    ///
    /// # Safety
    ///
    /// Called by the kernel with CPU Lock active, on the thread backing
    /// `task`. The port must not run any more task code on that thread
    /// after this returns.
    unsafe fn exit_and_dispatch(task: TaskRef<Self>);

    /// Yield the processor.
    ///
    /// In a task context, the port must invoke
    /// [`PortToKernel::choose_running_task`] and transfer control to the
    /// task it returns, returning to the caller only when the calling task
    /// is scheduled again. In an interrupt context, the port must instead
    /// remember the request and perform the switch when the interrupt
    /// handler completes.
    ///
    /// # Safety
    ///
    /// Called by the kernel with CPU Lock inactive.
    unsafe fn yield_cpu();
}

/// Associates a system type with its kernel state. Implemented by the port
/// alongside [`Port`].
pub trait KernelTraits: Port {
    /// The kernel state. The port stores this in a `static` and hands out a
    /// reference here.
    fn state() -> &'static State<Self>;
}

/// The interface the kernel exposes *to* the port. This trait is
/// blanket-implemented for every [`KernelTraits`] type; the port never
/// implements it.
pub trait PortToKernel: KernelTraits {
    /// Adopt the calling thread as the root task with the given priority
    /// and start the kernel's time base. Called once, before any other
    /// kernel entry point, with CPU Lock inactive.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, exactly once.
    unsafe fn boot(priority: Priority) -> TaskRef<Self>;

    /// Advance the tick time base by one tick, expiring timeouts. Called by
    /// the port's (simulated) timer interrupt handler with CPU Lock
    /// inactive, in an interrupt context.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port.
    unsafe fn timer_tick();

    /// Make a scheduling decision and return the task that should run next,
    /// or `None` if no task is ready.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, with CPU Lock active.
    unsafe fn choose_running_task() -> Option<TaskRef<Self>>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(priority: Priority) -> TaskRef<Self> {
        task::boot_root::<Self>(priority)
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Self>();
    }

    unsafe fn choose_running_task() -> Option<TaskRef<Self>> {
        // Safety: CPU Lock is active per this method's contract
        let mut lock = unsafe { klock::assume_cpu_lock::<Self>() };
        task::choose_next_running_task(lock.borrow_mut());
        let task = Self::state().running_task(lock.borrow_mut());
        // CPU Lock must stay active after this method returns
        core::mem::forget(lock);
        task
    }
}
