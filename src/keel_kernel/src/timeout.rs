//! Tick time base and timeouts
//!
//! Time is kept as a free-running `u32` tick counter that is expected to
//! wrap around. All comparisons are made in wrapping arithmetic relative to
//! the current time, which is correct as long as every armed deadline lies
//! less than [`DURATION_MAX`] ticks in the future. Expired entries are
//! removed on the very tick they expire, preserving that property.
use arrayvec::ArrayVec;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskRef},
    utils::{
        binary_heap::{BinaryHeap, BinaryHeapCtx},
        Init,
    },
    wait, KernelTraits, Port, WaitError, WaitResult, NUM_TASKS,
};

/// The kernel time representation, measured in ticks.
pub type Time32 = u32;

/// A timeout value that causes a blocking operation to fail immediately
/// instead of waiting.
pub const IMMEDIATE: Time32 = 0;

/// A timeout value that causes a blocking operation to wait indefinitely.
pub const INFINITE: Time32 = Time32::MAX;

/// The largest finite duration accepted by the timed operations. Deadlines
/// farther in the future than this cannot be told apart from points in the
/// past under wrapping comparison.
pub const DURATION_MAX: Time32 = 0x7fff_ffff;

/// `true` iff the point `at` has been reached at time `now`, in wrapping
/// arithmetic.
#[inline]
fn reached(now: Time32, at: Time32) -> bool {
    now.wrapping_sub(at) <= DURATION_MAX
}

/// When a blocked task should be woken up by the time base.
#[derive(Clone, Copy, Debug)]
pub(crate) enum WakeAt {
    /// No timeout; the task waits until explicitly woken.
    Never,
    /// Wake the task up with `Timeout` when this point is reached.
    At(Time32),
}

/// An armed timeout.
#[derive(Clone, Copy, Debug)]
struct TimeoutEntry {
    at: Time32,
    /// The arena index of the waiting task.
    task: usize,
}

/// Orders timeout entries by their distance from the current time.
struct TimeoutCtx {
    origin: Time32,
}

impl BinaryHeapCtx<TimeoutEntry> for TimeoutCtx {
    fn lt(&mut self, x: &TimeoutEntry, y: &TimeoutEntry) -> bool {
        x.at.wrapping_sub(self.origin) < y.at.wrapping_sub(self.origin)
    }
}

/// The timeout-related part of the kernel state.
pub(crate) struct TimeoutGlobals<Traits: Port> {
    /// The current tick count.
    current_time: CpuLockCell<Traits, Time32>,

    /// Armed timeouts, a min-heap keyed by expiry point. Each live task has
    /// at most one entry, mirrored by `TaskCb::wake_at`.
    heap: CpuLockCell<Traits, ArrayVec<TimeoutEntry, NUM_TASKS>>,
}

impl<Traits: Port> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        current_time: Init::INIT,
        heap: Init::INIT,
    };
}

impl<Traits: Port> core::fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("current_time", &self.current_time)
            .finish_non_exhaustive()
    }
}

/// Get the current tick count. It wraps around on overflow.
pub fn tick_count<Traits: KernelTraits>() -> Time32 {
    let lock = klock::expect_cpu_lock::<Traits>();
    Traits::state().timeout.current_time.get(&*lock)
}

/// Convert a relative delay into a wake-up point. `delay` must not be
/// [`IMMEDIATE`]; the caller handles polling separately.
pub(crate) fn wake_at_after<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    delay: Time32,
) -> WakeAt {
    debug_assert_ne!(delay, IMMEDIATE);
    if delay == INFINITE {
        WakeAt::Never
    } else {
        assert!(delay <= DURATION_MAX, "delay out of range");
        let now = Traits::state().timeout.current_time.get(&*lock);
        WakeAt::At(now.wrapping_add(delay))
    }
}

/// Convert an absolute point into a wake-up point, failing with `Timeout`
/// if the point has already been reached.
pub(crate) fn wake_at_point<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    at: Time32,
) -> WaitResult<WakeAt> {
    let now = Traits::state().timeout.current_time.get(&*lock);
    if reached(now, at) {
        Err(WaitError::Timeout)
    } else {
        Ok(WakeAt::At(at))
    }
}

/// Arm a timeout for `task`, which must not already have one armed.
pub(crate) fn arm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    wake_at: WakeAt,
) {
    let WakeAt::At(at) = wake_at else {
        return;
    };
    debug_assert!(task.wake_at.get(&*lock).is_none());
    task.wake_at.replace(&mut *lock, Some(at));

    let globals = &Traits::state().timeout;
    let origin = globals.current_time.get(&*lock);
    let entry = TimeoutEntry {
        at,
        task: task::task_index(task),
    };
    globals
        .heap
        .write(&mut *lock)
        .heap_push(entry, TimeoutCtx { origin });
}

/// Disarm `task`'s timeout, if one is armed.
pub(crate) fn disarm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if task.wake_at.replace(&mut *lock, None).is_none() {
        return;
    }

    let i = task::task_index(task);
    let globals = &Traits::state().timeout;
    let origin = globals.current_time.get(&*lock);
    let heap = globals.heap.write(&mut *lock);
    match heap.iter().position(|e| e.task == i) {
        Some(pos) => {
            heap.heap_remove(pos, TimeoutCtx { origin });
        }
        None => panic!("timeout heap out of sync"),
    }
}

/// Advance the time base by one tick and wake every task whose deadline has
/// been reached. The port's timer interrupt handler calls this through
/// `PortToKernel::timer_tick` with CPU Lock inactive.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    let mut lock = klock::expect_cpu_lock::<Traits>();
    let globals = &Traits::state().timeout;

    let now = globals.current_time.get(&*lock).wrapping_add(1);
    globals.current_time.replace(&mut *lock, now);

    loop {
        let front = globals.heap.read(&*lock).first().copied();
        let Some(entry) = front else {
            break;
        };
        if !reached(now, entry.at) {
            break;
        }

        globals
            .heap
            .write(&mut *lock)
            .heap_pop(TimeoutCtx { origin: now });

        let task = task::task_by_index::<Traits>(entry.task);
        debug_assert_eq!(task.wake_at.get(&*lock), Some(entry.at));
        task.wake_at.replace(&mut *lock, None);
        wait::expire_wait(lock.borrow_mut(), task);
    }

    // A woken task may preempt whatever was running before the tick
    task::unlock_cpu_and_check_preemption::<Traits>(lock);
}

/// Return `true` iff at least one timeout is armed. The port uses this
/// when no task is ready, to tell an idle system (a future tick will wake
/// someone) apart from a deadlocked one.
pub fn has_armed_timeout<Traits: KernelTraits>() -> bool {
    let lock = klock::expect_cpu_lock::<Traits>();
    !Traits::state().timeout.heap.read(&*lock).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn reached_basic() {
        assert!(reached(100, 100));
        assert!(reached(100, 50));
        assert!(!reached(100, 101));
        assert!(!reached(100, 100 + DURATION_MAX));
    }

    #[test]
    fn reached_across_wraparound() {
        let near_wrap = Time32::MAX - 10;
        assert!(!reached(near_wrap, near_wrap.wrapping_add(20)));
        assert!(reached(near_wrap.wrapping_add(25), near_wrap.wrapping_add(20)));
        assert!(reached(5, near_wrap));
    }

    #[quickcheck]
    fn reached_is_translation_invariant(now: Time32, at: Time32, shift: Time32) -> bool {
        reached(now, at) == reached(now.wrapping_add(shift), at.wrapping_add(shift))
    }

    #[quickcheck]
    fn deadline_in_valid_range_not_reached_early(now: Time32, delay: Time32) -> bool {
        // A deadline `1..=DURATION_MAX` ticks ahead must not read as already
        // reached, regardless of where `now` sits relative to wraparound.
        let delay = delay % DURATION_MAX + 1;
        !reached(now, now.wrapping_add(delay))
    }

    #[quickcheck]
    fn ctx_orders_by_distance_from_origin(origin: Time32, a: Time32, b: Time32) -> bool {
        let mut ctx = TimeoutCtx { origin };
        let (ea, eb) = (
            TimeoutEntry { at: a, task: 0 },
            TimeoutEntry { at: b, task: 1 },
        );
        ctx.lt(&ea, &eb) == (a.wrapping_sub(origin) < b.wrapping_sub(origin))
    }
}
