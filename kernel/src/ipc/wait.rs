//! Wait queues: the blocking substrate shared by every IPC object.
//!
//! A wait queue is a FIFO of suspended tasks, each with an optional
//! deadline. A PID appears at most once in any given queue. Queues live
//! inside their owning object's spinlock; wake operations therefore only
//! *collect* the PIDs to wake and post their wake results; the caller
//! drops the object lock first and then unblocks the collected PIDs, so the
//! scheduler is never entered with an IPC lock held.
//!
//! The wake result (status + cookie) travels through a per-PID slot rather
//! than the queue entry itself, because the entry is gone by the time the
//! woken task runs. A `Signaled` result overwrites a pending `Timeout` for
//! the same PID: a waiter hit by both a signal and its deadline in the same
//! tick observes the signal.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::ipc::stats;
use crate::sched::{self, Pid};
use crate::sync::Spinlock;

/// Why a blocked task was woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited condition arrived (signal, post, handoff, message).
    Signaled,
    /// The wait's deadline expired.
    Timeout,
    /// A mutex owner exited while holding the lock.
    OwnerDead,
    /// The object was destroyed while the task was waiting.
    Destroyed,
}

/// One suspended task.
#[derive(Clone, Copy, Debug)]
pub struct Waiter {
    pub pid: Pid,
    /// Tick at which the task enqueued.
    pub enqueued_at: u64,
    /// Absolute deadline tick, `None` to wait forever.
    pub deadline: Option<u64>,
    /// Caller-defined word delivered with the wake result (object id of the
    /// triggering event for event sets; 0 otherwise).
    pub cookie: u32,
}

/// FIFO queue of suspended tasks, embedded in each blockable IPC object and
/// protected by that object's lock.
pub struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            waiters: VecDeque::new(),
        }
    }

    /// Append the task to the queue. Returns `false` (without enqueueing)
    /// if the PID is already present.
    pub fn enqueue(&mut self, pid: Pid, deadline: Option<u64>, cookie: u32) -> bool {
        if self.contains(pid) {
            return false;
        }
        self.waiters.push_back(Waiter {
            pid,
            enqueued_at: sched::now_ticks(),
            deadline,
            cookie,
        });
        stats::waiter_enqueued();
        true
    }

    /// Remove the task from the queue. Returns `true` if it was present.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.pid != pid);
        if self.waiters.len() != before {
            stats::waiter_removed();
            true
        } else {
            false
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.waiters.iter().any(|w| w.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// PID of the oldest waiter, if any.
    pub fn front(&self) -> Option<Pid> {
        self.waiters.front().map(|w| w.pid)
    }

    /// Dequeue up to `n` waiters (all of them when `n == 0`) in enqueue
    /// order, posting `status`/`cookie` as their wake result. Returns the
    /// PIDs to pass to [`unblock_all`] once the object lock is dropped.
    pub fn wake(&mut self, n: u32, status: WaitStatus, cookie: u32) -> Vec<Pid> {
        let count = if n == 0 { self.waiters.len() } else { n as usize };
        let mut woken = Vec::with_capacity(count.min(self.waiters.len()));
        for _ in 0..count {
            let Some(w) = self.waiters.pop_front() else {
                break;
            };
            stats::waiter_removed();
            post_result(w.pid, status, cookie);
            woken.push(w.pid);
        }
        woken
    }

    /// Expire every waiter whose deadline is at or before `now`, posting a
    /// `Timeout` result with the waiter's own cookie. Returns the PIDs to
    /// unblock once the object lock is dropped.
    pub fn sweep_deadlines(&mut self, now: u64) -> Vec<Pid> {
        let mut expired = Vec::new();
        self.waiters.retain(|w| match w.deadline {
            Some(deadline) if deadline <= now => {
                stats::waiter_removed();
                stats::timeout_expired();
                post_result(w.pid, WaitStatus::Timeout, w.cookie);
                expired.push(w.pid);
                false
            }
            _ => true,
        });
        expired
    }
}

// Per-PID wake results. A task has at most one pending result: it can only
// wait on one object at a time.
static RESULTS: Spinlock<BTreeMap<Pid, (WaitStatus, u32)>> = Spinlock::new(BTreeMap::new());

/// Record the wake result for a PID about to be unblocked.
///
/// `Signaled` replaces a pending `Timeout`; any other pending result wins
/// over a later post (the first definitive outcome stands).
pub(crate) fn post_result(pid: Pid, status: WaitStatus, cookie: u32) {
    let mut results = RESULTS.lock();
    match results.get(&pid) {
        None => {
            results.insert(pid, (status, cookie));
        }
        Some((WaitStatus::Timeout, _)) if status == WaitStatus::Signaled => {
            results.insert(pid, (status, cookie));
        }
        Some(_) => {}
    }
}

/// Consume the wake result for the calling task after `block_task` returns.
/// Absent a posted result the wake counts as `Signaled` (the waker always
/// posts before unblocking; this is the defensive default).
pub(crate) fn take_result(pid: Pid) -> (WaitStatus, u32) {
    RESULTS
        .lock()
        .remove(&pid)
        .unwrap_or((WaitStatus::Signaled, 0))
}

/// Drop any stale result for a PID (task exit).
pub(crate) fn clear_result(pid: Pid) {
    RESULTS.lock().remove(&pid);
}

/// Unblock the collected PIDs in order. Must be called with no IPC lock
/// held.
pub fn unblock_all(pids: &[Pid]) {
    for &pid in pids {
        sched::unblock_task(pid);
    }
}
