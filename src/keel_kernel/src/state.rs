//! The aggregated kernel state
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::{readyqueue::ReadyQueue, TaskArena, TaskCb, TaskRef},
    timeout::{TimeoutGlobals, Time32, IMMEDIATE},
    utils::Init,
    Port, NUM_TASKS,
};

/// The state data of the kernel. The port stores one instance of this in a
/// `static` and exposes it through [`KernelTraits::state`].
///
/// All interior mutability goes through [`CpuLockCell`], so a shared
/// reference suffices for every kernel operation.
///
/// [`KernelTraits::state`]: crate::KernelTraits::state
pub struct State<Traits: Port> {
    /// The task in the Running state, i.e., the task currently being
    /// executed. This is `None` during the interval between a task exiting
    /// and the next scheduling decision.
    running_task: CpuLockCell<Traits, Option<TaskRef<Traits>>>,

    pub(crate) ready_queue: ReadyQueue<Traits>,

    pub(crate) timeout: TimeoutGlobals<Traits>,

    /// Storage for all task control blocks.
    pub(crate) task_pool: [TaskCb<Traits>; NUM_TASKS],

    pub(crate) task_arena: CpuLockCell<Traits, TaskArena>,
}

impl<Traits: Port> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: CpuLockCell::new(None),
        ready_queue: Init::INIT,
        timeout: Init::INIT,
        task_pool: Init::INIT,
        task_arena: Init::INIT,
    };
}

impl<Traits: Port> State<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub(crate) fn running_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        self.running_task.get(&*lock)
    }

    pub(crate) fn set_running_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: Option<TaskRef<Traits>>,
    ) {
        self.running_task.replace(&mut *lock, task);
    }
}

impl<Traits: Port> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("running_task", &self.running_task)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Panic unless the current context is a task context. Operations that
/// transfer control away from the caller are impossible anywhere else.
pub(crate) fn assert_task_context<Traits: Port>() {
    assert!(
        Traits::is_task_context(),
        "this operation is only allowed in a task context"
    );
}

/// Panic if the operation could block in a context where blocking is not
/// allowed. A timeout of `IMMEDIATE` never blocks, so it is exempt.
pub(crate) fn assert_waitable<Traits: Port>(timeout: Time32) {
    assert!(
        timeout == IMMEDIATE || Traits::is_task_context(),
        "a blocking timeout is only allowed in a task context"
    );
}
