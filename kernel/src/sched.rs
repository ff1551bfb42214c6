//! Scheduler collaborator interface.
//!
//! The IPC core never touches scheduler internals; it consumes the narrow
//! contract below through free functions, the same way cross-platform code
//! in the rest of the kernel goes through a forwarding facade instead of
//! reaching into an implementation directly. The backend is installed once
//! at boot (or by the test harness) via [`install`].

use crate::sync::Spinlock;

/// Process/task identifier. 0 is invalid, 1 is the kernel itself.
pub type Pid = u32;

/// Never a live task.
pub const PID_INVALID: Pid = 0;
/// The kernel pseudo-task; owns boot-time IPC objects and may destroy anything.
pub const PID_KERNEL: Pid = 1;

/// Boost level requested for a mutex owner that is blocking a waiter.
/// The scheduler interprets the level; the IPC core only asks for the
/// ceiling and releases the request on ownership transfer.
pub const PRIORITY_BOOST_CEILING: u8 = 0;

/// The contract the IPC core requires from the scheduler.
///
/// `block_task`/`unblock_task` have permit semantics: an `unblock_task`
/// that arrives before the matching `block_task` makes that `block_task`
/// return immediately. The IPC core relies on this to close the window
/// between releasing an object lock and suspending.
///
/// Within one wait queue the core issues `unblock_task` calls in enqueue
/// order; the scheduler decides actual execution order.
pub trait Scheduler: Send + Sync {
    /// PID of the task executing the current IPC operation.
    fn current_pid(&self) -> Pid;

    /// Suspend the given task until [`Scheduler::unblock_task`] is called
    /// for it. Only ever invoked with the caller's own PID, with no IPC
    /// lock held.
    fn block_task(&self, pid: Pid);

    /// Make the given task runnable again (permit semantics, see trait docs).
    fn unblock_task(&self, pid: Pid);

    /// Monotonic tick counter. One tick is one millisecond.
    fn now_ticks(&self) -> u64;

    /// Register a hook run from the periodic timer tick.
    fn register_timer_hook(&self, hook: fn());

    /// Register a hook run when a task terminates.
    fn register_task_exit_hook(&self, hook: fn(Pid));

    /// Request a temporary priority boost for `pid` up to `level`.
    fn boost_priority(&self, pid: Pid, level: u8);

    /// Drop any priority boost previously requested for `pid`.
    fn reset_priority(&self, pid: Pid);
}

static SCHEDULER: Spinlock<Option<&'static dyn Scheduler>> = Spinlock::new(None);

/// Install the scheduler backend. Called once at boot, before `ipc::init`.
pub fn install(sched: &'static dyn Scheduler) {
    *SCHEDULER.lock() = Some(sched);
}

/// Whether a scheduler backend has been installed.
pub fn installed() -> bool {
    SCHEDULER.lock().is_some()
}

#[inline]
fn backend() -> &'static dyn Scheduler {
    // Copy the reference out so no spinlock is held across the call.
    SCHEDULER
        .lock()
        .expect("scheduler collaborator not installed")
}

/// PID of the currently running task.
pub fn current_pid() -> Pid {
    backend().current_pid()
}

/// Suspend the given task (see [`Scheduler::block_task`]).
pub fn block_task(pid: Pid) {
    backend().block_task(pid);
}

/// Make the given task runnable (see [`Scheduler::unblock_task`]).
pub fn unblock_task(pid: Pid) {
    backend().unblock_task(pid);
}

/// Current tick count (1 tick = 1 ms).
pub fn now_ticks() -> u64 {
    backend().now_ticks()
}

/// Register the periodic timeout hook.
pub fn register_timer_hook(hook: fn()) {
    backend().register_timer_hook(hook);
}

/// Register the task-exit cleanup hook.
pub fn register_task_exit_hook(hook: fn(Pid)) {
    backend().register_task_exit_hook(hook);
}

/// Request a priority boost for a lock owner blocking a waiter.
pub fn boost_priority(pid: Pid, level: u8) {
    backend().boost_priority(pid, level);
}

/// Release a previously requested priority boost.
pub fn reset_priority(pid: Pid) {
    backend().reset_priority(pid);
}

#[cfg(test)]
pub(crate) mod teststub {
    //! Minimal in-process backend for unit tests exercising non-blocking
    //! paths. Integration tests install a full host scheduler instead.

    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;

    pub struct StubScheduler {
        ticks: AtomicU64,
    }

    std::thread_local! {
        static CURRENT: core::cell::Cell<Pid> = const { core::cell::Cell::new(PID_KERNEL) };
    }

    impl Scheduler for StubScheduler {
        fn current_pid(&self) -> Pid {
            CURRENT.with(|c| c.get())
        }
        fn block_task(&self, _pid: Pid) {
            panic!("stub scheduler cannot block; use the host scheduler");
        }
        fn unblock_task(&self, _pid: Pid) {}
        fn now_ticks(&self) -> u64 {
            self.ticks.load(Ordering::Relaxed)
        }
        fn register_timer_hook(&self, _hook: fn()) {}
        fn register_task_exit_hook(&self, _hook: fn(Pid)) {}
        fn boost_priority(&self, _pid: Pid, _level: u8) {}
        fn reset_priority(&self, _pid: Pid) {}
    }

    static STUB: OnceLock<&'static StubScheduler> = OnceLock::new();

    /// Install the stub once per test binary and return it.
    pub fn install_stub() -> &'static StubScheduler {
        *STUB.get_or_init(|| {
            let stub: &'static StubScheduler = Box::leak(Box::new(StubScheduler {
                ticks: AtomicU64::new(0),
            }));
            super::install(stub);
            stub
        })
    }

    /// Set the PID reported for the calling thread.
    pub fn set_current_pid(pid: Pid) {
        CURRENT.with(|c| c.set(pid));
    }
}
