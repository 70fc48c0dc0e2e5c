//! Tasks and the scheduler
use core::{fmt, mem};

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, timeout,
    utils::Init,
    wait::{TaskWait, WaitPayload},
    KernelTraits, Port, Priority, Time32, NUM_TASKS, PRIORITY_LEVELS,
};

pub(crate) mod readyqueue;
use self::readyqueue::ScheduleDecision;

/// A reference to a task control block.
pub type TaskRef<Traits> = &'static TaskCb<Traits>;

/// Task state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The control block is not associated with a live task.
    Dormant,
    Ready,
    Running,
    /// The task is in the wait state caused by a blocking operation.
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// Membership of a task in an index-linked task list (the ready queue or a
/// wait queue). A task is in at most one such list at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

/// Head of an index-linked task list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ListHead {
    pub(crate) first: Option<usize>,
    pub(crate) last: Option<usize>,
}

impl Init for ListHead {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// The startup parameters of a task, handed to the port when the task is
/// spawned.
#[derive(Clone, Copy, Debug)]
pub struct TaskAttr {
    /// The entry point.
    pub entry: fn(usize),
    /// An arbitrary value passed to `entry`.
    pub param: usize,
    /// The requested stack size in bytes. A port may round this up.
    pub stack_size: usize,
}

/// *Task control block*: the kernel-managed state of a single task.
pub struct TaskCb<Traits: Port> {
    /// The port-managed state of the task, e.g., the thread backing it in a
    /// hosted environment.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) priority: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// List membership. `Some(_)` iff the task is currently linked into the
    /// ready queue or a wait queue.
    pub(crate) link: CpuLockCell<Traits, Option<Link>>,

    pub(crate) wait: TaskWait<Traits>,

    /// The armed timeout deadline, mirroring this task's entry in the
    /// timeout heap. `None` iff no entry exists.
    pub(crate) wake_at: CpuLockCell<Traits, Option<Time32>>,

    /// Arena free-list link, meaningful only while the block is Dormant and
    /// has been released by [`exit_task`].
    pub(crate) next_free: CpuLockCell<Traits, Option<usize>>,
}

impl<Traits: Port> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        priority: Init::INIT,
        st: Init::INIT,
        link: Init::INIT,
        wait: Init::INIT,
        wake_at: Init::INIT,
        next_free: Init::INIT,
    };
}

impl<Traits: Port> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("priority", &self.priority)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Allocation state of the task control block arena.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TaskArena {
    /// Head of the free list, linked through [`TaskCb::next_free`].
    free_head: Option<usize>,
    /// Number of control blocks ever handed out. Blocks beyond this index
    /// have never been used.
    used: usize,
}

impl Init for TaskArena {
    const INIT: Self = Self {
        free_head: None,
        used: 0,
    };
}

/// An owned handle to a spawned task.
pub struct Task<Traits: Port>(TaskRef<Traits>);

impl<Traits: Port> Clone for Task<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: Port> Copy for Task<Traits> {}

impl<Traits: Port> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&(self.0 as *const _)).finish()
    }
}

impl<Traits: KernelTraits> Task<Traits> {
    /// Get the task's priority.
    pub fn priority(&self) -> Priority {
        let lock = klock::expect_cpu_lock::<Traits>();
        self.0.priority.get(&*lock)
    }
}

pub(crate) fn task_index<Traits: KernelTraits>(task: TaskRef<Traits>) -> usize {
    let base = Traits::state().task_pool.as_ptr() as usize;
    (task as *const TaskCb<Traits> as usize - base) / mem::size_of::<TaskCb<Traits>>()
}

pub(crate) fn task_by_index<Traits: KernelTraits>(i: usize) -> TaskRef<Traits> {
    &Traits::state().task_pool[i]
}

fn link_of<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    i: usize,
) -> Link {
    match task_by_index::<Traits>(i).link.get(&*lock) {
        Some(link) => link,
        None => panic!("task list corrupted"),
    }
}

/// Append `task` to the back of the list headed by `head`.
///
/// `task` must not currently be in any list.
pub(crate) fn list_push_back<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head: &CpuLockCell<Traits, ListHead>,
    task: TaskRef<Traits>,
) {
    debug_assert!(task.link.get(&*lock).is_none());
    let i = task_index(task);
    let mut h = head.get(&*lock);
    match h.last {
        Some(last) => {
            let mut last_link = link_of::<Traits>(lock.borrow_mut(), last);
            last_link.next = Some(i);
            task_by_index::<Traits>(last)
                .link
                .replace(&mut *lock, Some(last_link));
            task.link.replace(
                &mut *lock,
                Some(Link {
                    prev: Some(last),
                    next: None,
                }),
            );
        }
        None => {
            h.first = Some(i);
            task.link.replace(
                &mut *lock,
                Some(Link {
                    prev: None,
                    next: None,
                }),
            );
        }
    }
    h.last = Some(i);
    head.replace(&mut *lock, h);
}

/// Insert `task` into the priority-ordered list headed by `head`, after any
/// tasks of the same priority (FIFO within a priority band).
///
/// `task` must not currently be in any list.
pub(crate) fn list_insert_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head: &CpuLockCell<Traits, ListHead>,
    task: TaskRef<Traits>,
) {
    debug_assert!(task.link.get(&*lock).is_none());
    let priority = task.priority.get(&*lock);

    // Find the first list element with a numerically greater (i.e., lower)
    // priority; `task` goes right before it.
    let mut cursor = head.get(&*lock).first;
    while let Some(c) = cursor {
        if task_by_index::<Traits>(c).priority.get(&*lock) > priority {
            break;
        }
        cursor = link_of::<Traits>(lock.borrow_mut(), c).next;
    }

    let Some(c) = cursor else {
        list_push_back(lock, head, task);
        return;
    };

    let i = task_index(task);
    let mut c_link = link_of::<Traits>(lock.borrow_mut(), c);
    let prev = c_link.prev;
    c_link.prev = Some(i);
    task_by_index::<Traits>(c).link.replace(&mut *lock, Some(c_link));
    task.link.replace(
        &mut *lock,
        Some(Link {
            prev,
            next: Some(c),
        }),
    );
    match prev {
        Some(p) => {
            let mut p_link = link_of::<Traits>(lock.borrow_mut(), p);
            p_link.next = Some(i);
            task_by_index::<Traits>(p).link.replace(&mut *lock, Some(p_link));
        }
        None => {
            let mut h = head.get(&*lock);
            h.first = Some(i);
            head.replace(&mut *lock, h);
        }
    }
}

/// Unlink `task` from the list headed by `head`. Does nothing if the task is
/// not in a list.
pub(crate) fn list_remove<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    head: &CpuLockCell<Traits, ListHead>,
    task: TaskRef<Traits>,
) {
    let Some(link) = task.link.get(&*lock) else {
        return;
    };
    let mut h = head.get(&*lock);
    match link.prev {
        Some(p) => {
            let mut p_link = link_of::<Traits>(lock.borrow_mut(), p);
            p_link.next = link.next;
            task_by_index::<Traits>(p).link.replace(&mut *lock, Some(p_link));
        }
        None => h.first = link.next,
    }
    match link.next {
        Some(n) => {
            let mut n_link = link_of::<Traits>(lock.borrow_mut(), n);
            n_link.prev = link.prev;
            task_by_index::<Traits>(n).link.replace(&mut *lock, Some(n_link));
        }
        None => h.last = link.prev,
    }
    head.replace(&mut *lock, h);
    task.link.replace(&mut *lock, None);
}

/// Unlink and return the task at the front of the list headed by `head`.
pub(crate) fn list_pop_front<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    head: &CpuLockCell<Traits, ListHead>,
) -> Option<TaskRef<Traits>> {
    let first = head.get(&*lock).first?;
    let task = task_by_index::<Traits>(first);
    list_remove(lock, head, task);
    Some(task)
}

/// Transition `task` into the Ready state and insert it into the ready
/// queue.
///
/// # Safety
///
/// `task` must not currently be in the ready queue or any wait queue.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    task.st.replace(&mut *lock, TaskSt::Ready);
    Traits::state().ready_queue.push_back_task(lock, task);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// the currently running one in the Ready state, call `Port::yield_cpu`.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let prev_task_priority = match Traits::state().running_task(lock.borrow_mut()) {
        Some(running_task) if running_task.st.get(&*lock) == TaskSt::Running => {
            running_task.priority.get(&*lock)
        }
        _ => usize::MAX,
    };

    let has_preempting_task = Traits::state()
        .ready_queue
        .has_ready_task_in_priority_range(lock.borrow_mut(), ..prev_task_priority);

    // Relinquish CPU Lock. After that, the port can freely call
    // `choose_running_task`.
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock is inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Elect the next task to run and update `running_task` accordingly.
///
/// The only context switch performed here is the update of `running_task`;
/// transferring control to the elected task is the port's job.
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // The priority of `running_task`. The special value `usize::MAX`
    // indicates that (1) there is no running task, or (2) there was one but
    // it is no longer runnable, and we need to elect a new task (possibly
    // "electing" `None`) in either case.
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_priority = match prev_running_task {
        Some(running_task) if running_task.st.get(&*lock) == TaskSt::Running => {
            running_task.priority.get(&*lock)
        }
        _ => usize::MAX,
    };

    let decision = Traits::state()
        .ready_queue
        .pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,

        // There's no task willing to take over the current one, and the
        // current one can still run.
        ScheduleDecision::Keep => {
            debug_assert_ne!(prev_task_priority, usize::MAX);
            return;
        }
    };

    if let Some(task) = next_running_task {
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == task as *const _ {
            // `task == prev_running_task`; nothing more to do
            return;
        }
    }

    // `prev_running_task` loses control of the processor.
    if let Some(running_task) = prev_running_task {
        match running_task.st.get(&*lock) {
            TaskSt::Running => {
                // Preempted; go back to the ready queue.
                // Safety: a Running task is not in any list
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            // Stays Waiting or Ready, or exited (Dormant)
            TaskSt::Waiting | TaskSt::Ready | TaskSt::Dormant => {}
        }
    }

    Traits::state().set_running_task(lock.borrow_mut(), next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Waiting state. Returns
/// when the task is woken up.
///
/// The current context must be a task context.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(Traits::is_task_context());

    let running_task = match Traits::state().running_task(lock.borrow_mut()) {
        Some(task) => task,
        None => panic!("no running task"),
    };
    debug_assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // Temporarily release CPU Lock before yielding the processor.
        // Safety: CPU Lock is active at this point and is re-acquired before
        // the kernel state is accessed again.
        unsafe {
            Traits::leave_cpu_lock();
            Traits::yield_cpu();
            Traits::enter_cpu_lock();
        }

        // Proceed only when woken up, not when merely scheduled in passing
        if running_task.st.get(&*lock) == TaskSt::Running {
            break;
        }
    }
}

/// Spawn a new task and make it Ready. Never blocks; a higher-priority
/// spawned task will preempt the caller before this function returns.
///
/// Returns `None` if all [`NUM_TASKS`] task control blocks are in use.
pub fn spawn<Traits: KernelTraits>(
    priority: Priority,
    entry: fn(usize),
    param: usize,
    stack_size: usize,
) -> Option<Task<Traits>> {
    assert!(priority < PRIORITY_LEVELS, "priority out of range");
    assert!(
        !Traits::is_interrupt_context(),
        "tasks cannot be spawned from an interrupt context"
    );

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let kernel_state = Traits::state();

    let mut arena = kernel_state.task_arena.get(&*lock);
    let slot = if let Some(i) = arena.free_head {
        arena.free_head = task_by_index::<Traits>(i).next_free.get(&*lock);
        i
    } else if arena.used < NUM_TASKS {
        arena.used += 1;
        arena.used - 1
    } else {
        return None;
    };
    kernel_state.task_arena.replace(&mut *lock, arena);

    let task = task_by_index::<Traits>(slot);
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Dormant);
    task.priority.replace(&mut *lock, priority);
    task.link.replace(&mut *lock, None);
    task.wake_at.replace(&mut *lock, None);
    task.wait.reset(lock.borrow_mut());

    let attr = TaskAttr {
        entry,
        param,
        stack_size,
    };
    // Safety: CPU Lock is active, and this is the only
    // `initialize_task_state` call for this activation of the control block
    unsafe { Traits::initialize_task_state(task, attr) };

    // Safety: the task is Dormant and not in any list
    unsafe { make_ready(lock.borrow_mut(), task) };

    unlock_cpu_and_check_preemption::<Traits>(lock);

    Some(Task(task))
}

/// Adopt the calling thread as the root task. Called by the port during
/// boot.
pub(crate) fn boot_root<Traits: KernelTraits>(priority: Priority) -> TaskRef<Traits> {
    assert!(priority < PRIORITY_LEVELS, "priority out of range");

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let kernel_state = Traits::state();

    let mut arena = kernel_state.task_arena.get(&*lock);
    assert_eq!(arena.used, 0, "the kernel has already booted");
    arena.used = 1;
    kernel_state.task_arena.replace(&mut *lock, arena);

    let task = task_by_index::<Traits>(0);
    task.priority.replace(&mut *lock, priority);
    task.st.replace(&mut *lock, TaskSt::Running);
    kernel_state.set_running_task(lock.borrow_mut(), Some(task));
    task
}

/// Terminate the calling task, releasing its control block.
///
/// # Safety
///
/// The caller must not execute any more task code after calling this
/// function. The port's task trampoline calls this when the entry function
/// returns; application code normally just returns from its entry function
/// instead.
pub unsafe fn exit_task<Traits: KernelTraits>() {
    state::assert_task_context::<Traits>();

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let kernel_state = Traits::state();

    let task = match kernel_state.running_task(lock.borrow_mut()) {
        Some(task) => task,
        None => panic!("no running task"),
    };
    debug_assert_eq!(task.st.get(&*lock), TaskSt::Running);

    task.st.replace(&mut *lock, TaskSt::Dormant);
    kernel_state.set_running_task(lock.borrow_mut(), None);

    // Return the control block to the arena
    let i = task_index(task);
    let mut arena = kernel_state.task_arena.get(&*lock);
    task.next_free.replace(&mut *lock, arena.free_head);
    arena.free_head = Some(i);
    kernel_state.task_arena.replace(&mut *lock, arena);

    // `exit_and_dispatch` expects CPU Lock to be active and will release it
    // itself
    mem::forget(lock);
    // Safety: CPU Lock is active, and `task` is the calling task
    unsafe { Traits::exit_and_dispatch(task) };
}

/// Count the task control blocks currently in use, the root task included.
/// Ports use this to detect tasks that are still live at shutdown.
pub fn live_task_count<Traits: KernelTraits>() -> usize {
    let lock = klock::expect_cpu_lock::<Traits>();
    let arena = Traits::state().task_arena.get(&*lock);

    let mut free = 0;
    let mut cursor = arena.free_head;
    while let Some(i) = cursor {
        free += 1;
        cursor = task_by_index::<Traits>(i).next_free.get(&*lock);
    }
    arena.used - free
}

/// Surrender the processor to other Ready tasks of the same priority. The
/// calling task goes to the back of its priority band.
pub fn yield_now<Traits: KernelTraits>() {
    state::assert_task_context::<Traits>();

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let task = match Traits::state().running_task(lock.borrow_mut()) {
        Some(task) => task,
        None => panic!("no running task"),
    };

    // Safety: a Running task is not in any list
    unsafe { make_ready(lock.borrow_mut(), task) };
    drop(lock);

    // Safety: CPU Lock is inactive
    unsafe { Traits::yield_cpu() };
}

/// Put the calling task to sleep for the given number of ticks,
/// [`IMMEDIATE`] to return immediately, or [`INFINITE`] to sleep until the
/// task is killed from outside (which no current operation does; an infinite
/// sleep is effectively permanent).
///
/// The task will not wake up before `delay` full ticks have elapsed.
///
/// [`IMMEDIATE`]: crate::IMMEDIATE
/// [`INFINITE`]: crate::INFINITE
pub fn sleep_for<Traits: KernelTraits>(delay: Time32) {
    state::assert_task_context::<Traits>();
    if delay == timeout::IMMEDIATE {
        return;
    }

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let wake_at = timeout::wake_at_after::<Traits>(lock.borrow_mut(), delay);
    // Expiry is the normal way out of a sleep, so `Timeout` is not an error
    // here
    let _ = crate::wait::wait_no_queue::<Traits>(lock.borrow_mut(), WaitPayload::Sleep, wake_at);
}

/// Put the calling task to sleep until the given point of the tick time
/// base. Returns immediately if the point has already passed.
pub fn sleep_until<Traits: KernelTraits>(at: Time32) {
    state::assert_task_context::<Traits>();

    let mut lock = klock::expect_cpu_lock::<Traits>();
    let wake_at = match timeout::wake_at_point::<Traits>(lock.borrow_mut(), at) {
        Ok(wake_at) => wake_at,
        Err(_) => return,
    };
    let _ = crate::wait::wait_no_queue::<Traits>(lock.borrow_mut(), WaitPayload::Sleep, wake_at);
}
