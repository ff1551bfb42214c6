//! Recursive sleeping mutex with direct ownership handoff.
//!
//! A mutex is owned by at most one task; the owner may re-lock recursively.
//! Contended lockers enqueue FIFO and suspend. Unlock at recursion zero
//! hands ownership directly to the oldest waiter before waking it, so a
//! concurrent `try_lock` during the transfer sees the mutex as owned and a
//! late arrival can never barge ahead of a waiter.
//!
//! While a waiter is enqueued the scheduler is asked to boost the owner to
//! the priority ceiling; the request is dropped when ownership transfers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipc::object::{self, ObjectHeader, ObjectKind, ObjectRef};
use crate::ipc::wait::{self, WaitQueue, WaitStatus};
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid, PID_INVALID, PID_KERNEL, PRIORITY_BOOST_CEILING};
use crate::sync::Spinlock;

/// A recursive, owner-tracked sleeping mutex.
pub struct Mutex {
    header: ObjectHeader,
    state: Spinlock<MutexState>,
}

struct MutexState {
    owner: Pid,
    recursion: u32,
    waiters: WaitQueue,
}

static MUTEXES: Spinlock<Vec<Arc<Mutex>>> = Spinlock::new(Vec::new());

/// Create a mutex, register it, and return the typed handle.
pub fn create_mutex(name: &str) -> Result<Arc<Mutex>> {
    let header = ObjectHeader::new(ObjectKind::Mutex, name, sched::current_pid())?;
    let mutex = Arc::new(Mutex {
        header,
        state: Spinlock::new(MutexState {
            owner: PID_INVALID,
            recursion: 0,
            waiters: WaitQueue::new(),
        }),
    });

    MUTEXES.lock().push(mutex.clone());
    if let Err(e) = object::register(ObjectRef::Mutex(mutex.clone())) {
        MUTEXES.lock().retain(|m| !Arc::ptr_eq(m, &mutex));
        return Err(e);
    }
    log::info!("created mutex \"{}\" (id {})", mutex.header.name(), mutex.header.id());
    Ok(mutex)
}

impl Mutex {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Acquire the mutex, blocking until it is available.
    ///
    /// Returns `OwnerDead` if the previous owner exited while the caller
    /// was waiting; the mutex is unlocked in that case and the protected
    /// state may be inconsistent.
    pub fn lock(&self) -> Result<()> {
        stats::operation(ObjectKind::Mutex);
        let pid = sched::current_pid();

        let owner = {
            let mut st = self.state.lock();
            if st.owner == pid {
                st.recursion += 1;
                return Ok(());
            }
            if st.owner == PID_INVALID {
                st.owner = pid;
                st.recursion = 1;
                return Ok(());
            }
            // Contended: enqueue, then suspend outside the lock. Ownership
            // is handed to us by the unlock path before we are woken.
            st.waiters.enqueue(pid, None, 0);
            st.owner
        };

        sched::boost_priority(owner, PRIORITY_BOOST_CEILING);
        sched::block_task(pid);

        match wait::take_result(pid).0 {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::OwnerDead => Err(IpcError::OwnerDead),
            WaitStatus::Destroyed => Err(IpcError::InvalidHandle),
            WaitStatus::Timeout => Err(IpcError::Timeout),
        }
    }

    /// Acquire the mutex without blocking. Returns `Busy` when contended.
    pub fn try_lock(&self) -> Result<()> {
        stats::operation(ObjectKind::Mutex);
        let pid = sched::current_pid();
        let mut st = self.state.lock();
        if st.owner == pid {
            st.recursion += 1;
            return Ok(());
        }
        if st.owner == PID_INVALID {
            st.owner = pid;
            st.recursion = 1;
            return Ok(());
        }
        Err(IpcError::Busy)
    }

    /// Release one level of ownership. Only the owner may unlock.
    pub fn unlock(&self) -> Result<()> {
        stats::operation(ObjectKind::Mutex);
        let pid = sched::current_pid();

        let woken = {
            let mut st = self.state.lock();
            if st.owner != pid {
                stats::permission_failure();
                return Err(IpcError::PermissionDenied);
            }
            st.recursion -= 1;
            if st.recursion > 0 {
                return Ok(());
            }
            // Hand ownership to the oldest waiter before waking it.
            let woken = st.waiters.wake(1, WaitStatus::Signaled, 0);
            match woken.first() {
                Some(&next) => {
                    st.owner = next;
                    st.recursion = 1;
                }
                None => st.owner = PID_INVALID,
            }
            woken
        };

        if !woken.is_empty() {
            sched::reset_priority(pid);
            wait::unblock_all(&woken);
        }
        Ok(())
    }

    /// Current owner (0 = unlocked). Advisory.
    pub fn owner(&self) -> Pid {
        self.state.lock().owner
    }

    /// Number of tasks blocked on this mutex. Advisory.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Destroy a mutex. Refused with `Busy` while it is owned or contended;
/// only the creator or the kernel may destroy it.
pub fn destroy_mutex(mutex: &Arc<Mutex>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != mutex.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    {
        let st = mutex.state.lock();
        if st.owner != PID_INVALID || !st.waiters.is_empty() {
            return Err(IpcError::Busy);
        }
    }
    match mutex.header.release_owner_hold() {
        Some(0) => {
            destroy_mutex_internal(mutex);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped and the
/// mutex force-released.
pub(crate) fn destroy_for_exit(mutex: &Arc<Mutex>) {
    destroy_mutex_internal(mutex);
}

fn destroy_mutex_internal(mutex: &Arc<Mutex>) {
    MUTEXES.lock().retain(|m| !Arc::ptr_eq(m, mutex));
    object::unregister(mutex.header.id());
    stats::object_destroyed(ObjectKind::Mutex);
    log::info!("destroyed mutex \"{}\"", mutex.header.name());
}

/// Task-exit hook: force-release every mutex the exiting task owns, waking
/// all of its waiters with `OwnerDead`, and purge the task from every mutex
/// wait queue.
pub fn cleanup_task_mutexes(pid: Pid) {
    let pool: Vec<Arc<Mutex>> = MUTEXES.lock().clone();
    for mutex in pool {
        let woken = {
            let mut st = mutex.state.lock();
            st.waiters.remove(pid);
            if st.owner == pid {
                st.owner = PID_INVALID;
                st.recursion = 0;
                log::warn!(
                    "task {} exited owning mutex \"{}\"; waking waiters",
                    pid,
                    mutex.header.name()
                );
                st.waiters.wake(0, WaitStatus::OwnerDead, 0)
            } else {
                Vec::new()
            }
        };
        if !woken.is_empty() {
            sched::reset_priority(pid);
            wait::unblock_all(&woken);
        }
    }
}

/// Periodic deadline sweep over every mutex wait queue.
pub fn check_timeouts(now: u64) {
    let pool: Vec<Arc<Mutex>> = MUTEXES.lock().clone();
    for mutex in pool {
        let expired = mutex.state.lock().waiters.sweep_deadlines(now);
        wait::unblock_all(&expired);
    }
}

/// Log every live mutex: name, owner, recursion depth, waiters.
pub fn dump_all_mutexes() {
    let pool = MUTEXES.lock();
    for m in pool.iter() {
        let st = m.state.lock();
        log::info!(
            "mutex \"{}\": owner={} recursion={} waiters={}",
            m.header.name(),
            st.owner,
            st.recursion,
            st.waiters.len()
        );
    }
}
