//! Counting semaphore with direct unit handoff.
//!
//! `post` with waiters present passes the unit straight to the oldest
//! waiter instead of incrementing the count, so a late `try_wait` can never
//! steal a posted unit from a blocked task. The invariant follows: waiters
//! present implies `value == 0`.
//!
//! Message queues embed two unregistered semaphores for slot accounting
//! ([`Semaphore::embedded`]); those support `reinit` so the queue can
//! resync them after task-death message purges.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipc::object::{self, ObjectHeader, ObjectKind, ObjectRef};
use crate::ipc::wait::{self, WaitQueue, WaitStatus};
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid, PID_KERNEL};
use crate::sync::Spinlock;

/// A counting semaphore.
pub struct Semaphore {
    header: ObjectHeader,
    state: Spinlock<SemState>,
}

struct SemState {
    value: i32,
    max_value: i32,
    waiters: WaitQueue,
}

static SEMAPHORES: Spinlock<Vec<Arc<Semaphore>>> = Spinlock::new(Vec::new());

/// Create a semaphore with the given initial value and no practical upper
/// bound, register it, and return the typed handle.
pub fn create_semaphore(name: &str, initial: u32) -> Result<Arc<Semaphore>> {
    create_semaphore_bounded(name, initial, i32::MAX as u32)
}

/// Create a semaphore whose value may not exceed `max`.
pub fn create_semaphore_bounded(name: &str, initial: u32, max: u32) -> Result<Arc<Semaphore>> {
    if initial > max || max > i32::MAX as u32 {
        return Err(IpcError::InvalidArgument);
    }
    let sem = Arc::new(Semaphore::embedded(name, initial as i32, max as i32)?);
    SEMAPHORES.lock().push(sem.clone());
    if let Err(e) = object::register(ObjectRef::Semaphore(sem.clone())) {
        SEMAPHORES.lock().retain(|s| !Arc::ptr_eq(s, &sem));
        return Err(e);
    }
    log::info!(
        "created semaphore \"{}\" (initial {}, max {})",
        sem.header.name(),
        initial,
        max
    );
    Ok(sem)
}

impl Semaphore {
    /// Construct a semaphore that lives inside another object and is not
    /// placed in the pool or the registry.
    pub(crate) fn embedded(name: &str, value: i32, max_value: i32) -> Result<Semaphore> {
        Ok(Semaphore {
            header: ObjectHeader::new(ObjectKind::Semaphore, name, sched::current_pid())?,
            state: Spinlock::new(SemState {
                value,
                max_value,
                waiters: WaitQueue::new(),
            }),
        })
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Decrement the semaphore, blocking while the value is zero.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Decrement the semaphore, waiting at most `timeout_ms` milliseconds.
    pub fn wait_timeout(&self, timeout_ms: u64) -> Result<()> {
        self.wait_inner(Some(timeout_ms))
    }

    fn wait_inner(&self, timeout_ms: Option<u64>) -> Result<()> {
        stats::operation(ObjectKind::Semaphore);
        let pid = sched::current_pid();

        {
            let mut st = self.state.lock();
            if st.value > 0 {
                st.value -= 1;
                return Ok(());
            }
            if timeout_ms == Some(0) {
                return Err(IpcError::Timeout);
            }
            let deadline = timeout_ms.map(|ms| sched::now_ticks() + ms);
            st.waiters.enqueue(pid, deadline, 0);
        }

        sched::block_task(pid);

        // A Signaled wake means the poster skipped its own increment and
        // handed the unit to us; no decrement happens here.
        match wait::take_result(pid).0 {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::Timeout => Err(IpcError::Timeout),
            WaitStatus::Destroyed => Err(IpcError::InvalidHandle),
            WaitStatus::OwnerDead => Err(IpcError::OwnerDead),
        }
    }

    /// Decrement the semaphore without blocking. Returns `Busy` at zero.
    pub fn try_wait(&self) -> Result<()> {
        stats::operation(ObjectKind::Semaphore);
        let mut st = self.state.lock();
        if st.value > 0 {
            st.value -= 1;
            Ok(())
        } else {
            Err(IpcError::Busy)
        }
    }

    /// Increment the semaphore, or hand the unit to the oldest waiter.
    /// Returns `Overflow` when the value is already at its maximum.
    pub fn post(&self) -> Result<()> {
        stats::operation(ObjectKind::Semaphore);
        let woken = {
            let mut st = self.state.lock();
            if !st.waiters.is_empty() {
                st.waiters.wake(1, WaitStatus::Signaled, 0)
            } else if st.value < st.max_value {
                st.value += 1;
                return Ok(());
            } else {
                return Err(IpcError::Overflow);
            }
        };
        wait::unblock_all(&woken);
        Ok(())
    }

    /// Current value. Advisory: it may change before the caller acts on it.
    pub fn value(&self) -> i32 {
        self.state.lock().value
    }

    /// Number of tasks blocked on this semaphore. Advisory.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Reset value and bound in place, handing surplus units to queued
    /// waiters so the waiters-imply-zero invariant is restored.
    pub(crate) fn reinit(&self, value: i32, max_value: i32) {
        let woken = {
            let mut st = self.state.lock();
            st.max_value = max_value;
            st.value = value;
            let mut woken = Vec::new();
            while st.value > 0 && !st.waiters.is_empty() {
                woken.extend(st.waiters.wake(1, WaitStatus::Signaled, 0));
                st.value -= 1;
            }
            woken
        };
        wait::unblock_all(&woken);
    }

    /// Wake every waiter with the given status (object teardown).
    pub(crate) fn wake_all(&self, status: WaitStatus) {
        let woken = self.state.lock().waiters.wake(0, status, 0);
        wait::unblock_all(&woken);
    }

    /// Expire due deadlines on this semaphore's wait queue.
    pub(crate) fn sweep(&self, now: u64) {
        let expired = self.state.lock().waiters.sweep_deadlines(now);
        wait::unblock_all(&expired);
    }

    /// Remove a task from this semaphore's wait queue (task exit).
    pub(crate) fn purge_waiter(&self, pid: Pid) {
        self.state.lock().waiters.remove(pid);
    }
}

/// Destroy a semaphore. Waiters are woken and observe `InvalidHandle`;
/// only the creator or the kernel may destroy it.
pub fn destroy_semaphore(sem: &Arc<Semaphore>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != sem.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    match sem.header.release_owner_hold() {
        Some(0) => {
            destroy_semaphore_internal(sem);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped.
pub(crate) fn destroy_for_exit(sem: &Arc<Semaphore>) {
    destroy_semaphore_internal(sem);
}

fn destroy_semaphore_internal(sem: &Arc<Semaphore>) {
    sem.wake_all(WaitStatus::Destroyed);
    SEMAPHORES.lock().retain(|s| !Arc::ptr_eq(s, sem));
    object::unregister(sem.header.id());
    stats::object_destroyed(ObjectKind::Semaphore);
    log::info!("destroyed semaphore \"{}\"", sem.header.name());
}

/// Task-exit hook: purge the task from every semaphore wait queue.
pub fn cleanup_task_semaphores(pid: Pid) {
    let pool: Vec<Arc<Semaphore>> = SEMAPHORES.lock().clone();
    for sem in pool {
        sem.purge_waiter(pid);
    }
}

/// Periodic deadline sweep over every registered semaphore.
pub fn check_timeouts(now: u64) {
    let pool: Vec<Arc<Semaphore>> = SEMAPHORES.lock().clone();
    for sem in pool {
        sem.sweep(now);
    }
}

/// Log every live semaphore: name, value, bound, waiters.
pub fn dump_all_semaphores() {
    let pool = SEMAPHORES.lock();
    for s in pool.iter() {
        let st = s.state.lock();
        log::info!(
            "semaphore \"{}\": value={}/{} waiters={}",
            s.header.name(),
            st.value,
            st.max_value,
            st.waiters.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::teststub;

    #[test]
    fn post_then_wait_is_identity() {
        teststub::install_stub();
        teststub::set_current_pid(60);
        let s = create_semaphore("t_post_wait", 0).unwrap();
        s.post().unwrap();
        assert_eq!(s.value(), 1);
        s.wait().unwrap();
        assert_eq!(s.value(), 0);
        destroy_semaphore(&s).unwrap();
    }

    #[test]
    fn try_wait_fails_at_zero() {
        teststub::install_stub();
        teststub::set_current_pid(61);
        let s = create_semaphore("t_try", 1).unwrap();
        s.try_wait().unwrap();
        assert_eq!(s.try_wait(), Err(IpcError::Busy));
        destroy_semaphore(&s).unwrap();
    }

    #[test]
    fn post_at_max_overflows() {
        teststub::install_stub();
        teststub::set_current_pid(62);
        let s = create_semaphore_bounded("t_overflow", 2, 2).unwrap();
        assert_eq!(s.post(), Err(IpcError::Overflow));
        assert_eq!(s.value(), 2);
        destroy_semaphore(&s).unwrap();
    }

    #[test]
    fn timed_wait_at_zero_with_zero_timeout() {
        teststub::install_stub();
        teststub::set_current_pid(63);
        let s = create_semaphore("t_zero_timeout", 0).unwrap();
        assert_eq!(s.wait_timeout(0), Err(IpcError::Timeout));
        destroy_semaphore(&s).unwrap();
    }

    #[test]
    fn reinit_restores_counts() {
        teststub::install_stub();
        teststub::set_current_pid(64);
        let s = Semaphore::embedded("t_reinit", 5, 8).unwrap();
        s.try_wait().unwrap();
        s.reinit(3, 8);
        assert_eq!(s.value(), 3);
    }
}
