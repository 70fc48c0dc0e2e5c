//! Simulation environment for running the Keel kernel on a hosted target.
//!
//! Every task is backed by one operating system thread, but at most one of
//! them holds the *processor grant* at any moment, so the kernel observes a
//! single-core machine. The tick time base is virtual: whenever no task is
//! runnable and a timeout is armed, the thread performing the dispatch
//! delivers timer interrupts back-to-back instead of sleeping, which makes
//! timing-dependent tests instantaneous and deterministic.
//!
//! The entry point is [`boot`]. The calling thread is adopted as the root
//! task and runs the supplied closure; [`boot`] returns once the closure
//! returns and every other task has exited.
#![deny(unsafe_op_in_unsafe_fn)]

use keel_kernel::{utils::Init, KernelTraits, Port, PortToKernel, State, TaskAttr, TaskRef};
use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex as StdMutex,
    },
    thread,
};

/// The stack size given to task threads spawned with [`spawn`].
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Floor for task thread stacks. Entry functions run arbitrary test code, so
/// tiny requested stacks are rounded up rather than honored literally.
const MIN_STACK_SIZE: usize = 128 * 1024;

/// The kernel instantiation for the simulator.
pub struct System;

static KERNEL_STATE: State<System> = State::new();

/// The port-specific part of a task control block: the `Slab` key of the
/// backing thread, or `None` while the task is dormant.
#[derive(Debug)]
pub struct TaskState {
    thread: SpinMutex<Option<usize>>,
}

impl TaskState {
    const fn new() -> Self {
        Self {
            thread: SpinMutex::new(None),
        }
    }

    fn slot(&self) -> usize {
        match *self.thread.lock() {
            Some(slot) => slot,
            None => panic!("the task has no backing thread"),
        }
    }
}

impl Init for TaskState {
    const INIT: Self = Self::new();
}

/// The role of the current thread with respect to the simulated processor.
///
/// `slot` is `Some` on threads that back a task (the boot thread included).
/// `interrupt_depth` counts nested interrupt service routines; the processor
/// is in an interrupt context whenever it is non-zero. `switch_pended`
/// records a context switch requested from an interrupt context, taken when
/// the outermost interrupt bracket exits.
thread_local! {
    static CURRENT_SLOT: Cell<Option<usize>> = Cell::new(None);
    static INTERRUPT_DEPTH: Cell<usize> = Cell::new(0);
    static SWITCH_PENDED: Cell<bool> = Cell::new(false);
}

/// The simulated CPU Lock flag. Only the thread holding the processor grant
/// (or one running an interrupt bracket on it) ever takes this, so the spin
/// loop in `cpu_lock_enter` never actually spins in practice.
static CPU_LOCK: AtomicBool = AtomicBool::new(false);

fn cpu_lock_try_enter() -> bool {
    CPU_LOCK
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

fn cpu_lock_leave() {
    debug_assert!(CPU_LOCK.load(Ordering::Relaxed));
    CPU_LOCK.store(false, Ordering::Release);
}

struct WorkerThread {
    join: Option<thread::JoinHandle<()>>,
}

struct SchedState {
    /// The `Slab` key of the one thread allowed to run task code.
    granted: Option<usize>,
    threads: Slab<WorkerThread>,
}

struct PortState {
    sched: StdMutex<SchedState>,
    grant_changed: Condvar,
}

static PORT_STATE: Lazy<PortState> = Lazy::new(|| PortState {
    sched: StdMutex::new(SchedState {
        granted: None,
        threads: Slab::new(),
    }),
    grant_changed: Condvar::new(),
});

/// Hand the processor grant to the given thread and wake it.
fn grant(slot: usize) {
    let mut sched = PORT_STATE.sched.lock().unwrap();
    log::trace!("grant({slot:?}), was {:?}", sched.granted);
    sched.granted = Some(slot);
    PORT_STATE.grant_changed.notify_all();
}

/// Block the calling thread until it holds the processor grant.
fn wait_until_granted(me: usize) {
    let mut sched = PORT_STATE.sched.lock().unwrap();
    while sched.granted != Some(me) {
        sched = PORT_STATE.grant_changed.wait(sched).unwrap();
    }
}

/// Run the timer interrupt handler in an interrupt bracket, leaving any
/// requested context switch pended.
fn raw_tick() {
    INTERRUPT_DEPTH.with(|d| d.set(d.get() + 1));
    // Safety: we are the port, and the processor grant serializes this with
    // all task code
    unsafe { <System as PortToKernel>::timer_tick() };
    INTERRUPT_DEPTH.with(|d| d.set(d.get() - 1));
}

/// Advance virtual time by one tick because no task is runnable. Returns the
/// kernel's choice of the next task to run, which may still be `None`.
///
/// Panics if no timeout is armed, because then no tick can ever make a task
/// runnable again.
fn idle_step() -> Option<TaskRef<System>> {
    if !keel_kernel::timeout::has_armed_timeout::<System>() {
        panic!("deadlock: every task is waiting and no timeout is armed");
    }
    raw_tick();
    // The re-dispatch below subsumes the switch the tick handler pended
    SWITCH_PENDED.with(|p| p.set(false));

    // Safety: CPU Lock is inactive on this thread
    unsafe { <System as Port>::enter_cpu_lock() };
    // Safety: CPU Lock is active
    let next = unsafe { <System as PortToKernel>::choose_running_task() };
    cpu_lock_leave();
    next
}

/// Transfer control to `next`, delivering virtual ticks while `next` is
/// `None`. Returns once the calling thread is the running task again.
fn dispatch(mut next: Option<TaskRef<System>>) {
    let me = CURRENT_SLOT
        .with(|s| s.get())
        .unwrap_or_else(|| panic!("dispatch outside a task thread"));

    loop {
        match next {
            Some(task) => {
                let slot = task.port_task_state.slot();
                if slot == me {
                    return;
                }
                grant(slot);
                wait_until_granted(me);
                return;
            }
            None => next = idle_step(),
        }
    }
}

/// The body of a thread backing a task spawned with [`spawn`].
fn task_thread_body(task: TaskRef<System>, attr: TaskAttr, slot: usize) {
    CURRENT_SLOT.with(|s| s.set(Some(slot)));
    wait_until_granted(slot);
    log::trace!("task thread {slot} starting, task = {task:p}, entry = {:p}", attr.entry);

    (attr.entry)(attr.param);

    log::trace!("task thread {slot} exiting");
    // Safety: nothing else runs on this thread afterwards
    unsafe { keel_kernel::exit_task::<System>() };
}

impl Port for System {
    type PortTaskState = TaskState;

    unsafe fn try_enter_cpu_lock() -> bool {
        cpu_lock_try_enter()
    }

    unsafe fn enter_cpu_lock() {
        while !cpu_lock_try_enter() {
            std::hint::spin_loop();
        }
    }

    unsafe fn leave_cpu_lock() {
        cpu_lock_leave();
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.load(Ordering::Relaxed)
    }

    fn is_task_context() -> bool {
        CURRENT_SLOT.with(|s| s.get()).is_some() && INTERRUPT_DEPTH.with(|d| d.get()) == 0
    }

    fn is_interrupt_context() -> bool {
        INTERRUPT_DEPTH.with(|d| d.get()) != 0
    }

    unsafe fn initialize_task_state(task: TaskRef<Self>, attr: TaskAttr) {
        let mut sched = PORT_STATE.sched.lock().unwrap();
        let slot = sched.threads.insert(WorkerThread { join: None });
        *task.port_task_state.thread.lock() = Some(slot);

        let handle = thread::Builder::new()
            .name(format!("keel task {slot}"))
            .stack_size(attr.stack_size.max(MIN_STACK_SIZE))
            .spawn(move || task_thread_body(task, attr, slot))
            .unwrap_or_else(|e| panic!("failed to spawn a task thread: {e}"));
        sched.threads[slot].join = Some(handle);
        log::trace!("initialize_task_state({task:p}) -> thread {slot}");
    }

    unsafe fn exit_and_dispatch(task: TaskRef<Self>) {
        log::trace!("exit_and_dispatch({task:p})");
        // Safety: the kernel exits a task with CPU Lock active and leaves
        // releasing it to us
        let mut next = unsafe { <System as PortToKernel>::choose_running_task() };
        cpu_lock_leave();

        // Dissociate this thread from the control block, which the kernel has
        // already returned to the arena
        *task.port_task_state.thread.lock() = None;
        CURRENT_SLOT.with(|s| s.set(None));

        let next_slot = loop {
            match next {
                Some(task) => break task.port_task_state.slot(),
                None => next = idle_step(),
            }
        };
        grant(next_slot);
        // The thread body returns and the backing thread terminates; its
        // join handle is collected when `boot` shuts down
    }

    unsafe fn yield_cpu() {
        if Self::is_interrupt_context() {
            SWITCH_PENDED.with(|p| p.set(true));
            return;
        }

        // Safety: `yield_cpu` is called with CPU Lock inactive
        unsafe { Self::enter_cpu_lock() };
        // Safety: CPU Lock is active
        let next = unsafe { <System as PortToKernel>::choose_running_task() };
        cpu_lock_leave();
        dispatch(next);
    }
}

impl KernelTraits for System {
    fn state() -> &'static State<Self> {
        &KERNEL_STATE
    }
}

/// Boot the kernel, adopting the calling thread as the root task at the
/// given priority, and run `f` as the root task's body.
///
/// Returns once `f` returns. Panics if `f` returns while other tasks are
/// still live; tests are expected to synchronize with every task they spawn
/// before finishing.
pub fn boot(root_priority: Priority, f: impl FnOnce()) {
    let _ = env_logger::builder().is_test(true).try_init();

    let slot = {
        let mut sched = PORT_STATE.sched.lock().unwrap();
        let slot = sched.threads.insert(WorkerThread { join: None });
        sched.granted = Some(slot);
        slot
    };
    CURRENT_SLOT.with(|s| s.set(Some(slot)));

    // Safety: we are the port, CPU Lock is inactive, and `boot` panics on
    // reentry rather than double-booting
    let root = unsafe { <System as PortToKernel>::boot(root_priority) };
    *root.port_task_state.thread.lock() = Some(slot);
    log::debug!("booted, root task = {root:p} on thread {slot}");

    f();

    shutdown(root);
}

fn shutdown(root: TaskRef<System>) {
    assert_eq!(
        keel_kernel::task::live_task_count::<System>(),
        1,
        "the boot closure returned while other tasks were still live"
    );

    let handles = {
        let mut sched = PORT_STATE.sched.lock().unwrap();
        sched
            .threads
            .iter_mut()
            .filter_map(|(_, worker)| worker.join.take())
            .collect::<Vec<_>>()
    };
    log::debug!("shutting down, joining {} task threads", handles.len());
    for handle in handles {
        // Propagate any panic that occurred in a task thread
        if let Err(e) = handle.join() {
            std::panic::resume_unwind(e);
        }
    }

    *root.port_task_state.thread.lock() = None;
}

/// Deliver one timer interrupt, advancing the tick time base by one tick.
///
/// Must be called from a task context. If the tick wakes a task of higher
/// priority than the caller, the switch happens before this function
/// returns, exactly like a hardware timer interrupt preempting the running
/// task.
pub fn deliver_tick() {
    with_interrupt_context(|| {
        // Safety: we are the port, and the grant serializes this with task
        // code
        unsafe { <System as PortToKernel>::timer_tick() };
    });
}

/// Deliver `n` timer interrupts in sequence.
pub fn deliver_ticks(n: u32) {
    for _ in 0..n {
        deliver_tick();
    }
}

/// Run `f` in a simulated interrupt context on the current thread.
///
/// Inside `f` the kernel reports an interrupt context, blocking operations
/// panic, and context switches are pended. A pended switch is taken when the
/// outermost bracket exits, mirroring interrupt return on real hardware.
pub fn with_interrupt_context<R>(f: impl FnOnce() -> R) -> R {
    INTERRUPT_DEPTH.with(|d| d.set(d.get() + 1));
    let result = f();
    INTERRUPT_DEPTH.with(|d| d.set(d.get() - 1));

    if INTERRUPT_DEPTH.with(|d| d.get()) == 0 && SWITCH_PENDED.with(|p| p.replace(false)) {
        // Safety: CPU Lock is inactive and we are back in a task context
        unsafe { <System as Port>::yield_cpu() };
    }
    result
}

/// A semaphore of the simulated kernel.
pub type Semaphore = keel_kernel::Semaphore<System>;
/// A mutex of the simulated kernel.
pub type Mutex = keel_kernel::Mutex<System>;
/// An event flag object of the simulated kernel.
pub type EventFlag = keel_kernel::EventFlag<System>;
/// A message queue of the simulated kernel.
pub type MsgQueue<const N: usize> = keel_kernel::MsgQueue<System, N>;
/// A task handle of the simulated kernel.
pub type Task = keel_kernel::Task<System>;

pub use keel_kernel::{
    EventFlagBits, EventFlagWaitFlags, Priority, SemaphoreValue, Time32, UnlockError, WaitError,
    WaitResult,
    DURATION_MAX, IMMEDIATE, INFINITE, NUM_TASKS, PRIORITY_LEVELS, SEM_BINARY, SEM_COUNTING,
};

/// Spawn a task with the default stack size. See [`keel_kernel::spawn`].
pub fn spawn(priority: Priority, entry: fn(usize), param: usize) -> Option<Task> {
    keel_kernel::spawn::<System>(priority, entry, param, DEFAULT_STACK_SIZE)
}

/// See [`keel_kernel::yield_now`].
pub fn yield_now() {
    keel_kernel::yield_now::<System>();
}

/// See [`keel_kernel::sleep_for`].
pub fn sleep_for(delay: Time32) {
    keel_kernel::sleep_for::<System>(delay);
}

/// See [`keel_kernel::sleep_until`].
pub fn sleep_until(at: Time32) {
    keel_kernel::sleep_until::<System>(at);
}

/// See [`keel_kernel::tick_count`].
pub fn tick_count() -> Time32 {
    keel_kernel::tick_count::<System>()
}
