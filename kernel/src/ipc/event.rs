//! Events and event sets.
//!
//! An event is a binary flag tasks can wait on. Auto-reset events hand the
//! signal to exactly one waiter and clear themselves; manual-reset events
//! wake everyone and stay signaled until reset. An event set groups up to
//! [`MAX_EVENTS_PER_SET`] events so a task can wait for any one of them.
//!
//! Lock order: set lock first, then member event locks in array order,
//! released as the scan advances. The set lock is held across the scan and
//! the enqueue, so a signal cannot slip between "nothing signaled" and
//! "task parked" (the lost-wakeup window). The signal path updates the
//! event under its own lock, drops it, and only then takes set locks to
//! notify set-waiters, so the nesting order is never reversed.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::ipc::object::{self, ObjectHeader, ObjectKind, ObjectRef};
use crate::ipc::wait::{self, WaitQueue, WaitStatus};
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid, PID_KERNEL};
use crate::sync::Spinlock;

/// Maximum number of events in one event set.
pub const MAX_EVENTS_PER_SET: usize = 32;

bitflags! {
    /// Event creation flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EventFlags: u32 {
        /// Event stays signaled until explicitly reset.
        const MANUAL_RESET  = 1 << 0;
        /// Event starts in the signaled state.
        const INITIALLY_SET = 1 << 1;
    }
}

/// A binary event flag.
pub struct Event {
    header: ObjectHeader,
    state: Spinlock<EventState>,
}

struct EventState {
    signaled: bool,
    manual_reset: bool,
    waiters: WaitQueue,
}

/// A fixed-capacity group of events that can be waited on together.
pub struct EventSet {
    header: ObjectHeader,
    state: Spinlock<EventSetState>,
}

struct EventSetState {
    members: Vec<Arc<Event>>,
    capacity: usize,
    waiters: WaitQueue,
}

static EVENTS: Spinlock<Vec<Arc<Event>>> = Spinlock::new(Vec::new());
static EVENT_SETS: Spinlock<Vec<Arc<EventSet>>> = Spinlock::new(Vec::new());

/// Create an auto-reset, initially non-signaled event.
pub fn create_event(name: &str) -> Result<Arc<Event>> {
    create_event_with(name, EventFlags::empty())
}

/// Create an event with explicit reset/initial-state flags.
pub fn create_event_with(name: &str, flags: EventFlags) -> Result<Arc<Event>> {
    let header = ObjectHeader::new(ObjectKind::Event, name, sched::current_pid())?;
    let event = Arc::new(Event {
        header,
        state: Spinlock::new(EventState {
            signaled: flags.contains(EventFlags::INITIALLY_SET),
            manual_reset: flags.contains(EventFlags::MANUAL_RESET),
            waiters: WaitQueue::new(),
        }),
    });
    EVENTS.lock().push(event.clone());
    if let Err(e) = object::register(ObjectRef::Event(event.clone())) {
        EVENTS.lock().retain(|ev| !Arc::ptr_eq(ev, &event));
        return Err(e);
    }
    log::info!("created event \"{}\" (id {})", event.header.name(), event.header.id());
    Ok(event)
}

impl Event {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Block until the event is signaled.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Block until the event is signaled or `timeout_ms` elapses.
    /// A zero timeout polls: it consumes a pending signal or fails with
    /// `Timeout` immediately.
    pub fn timed_wait(&self, timeout_ms: u64) -> Result<()> {
        self.wait_inner(Some(timeout_ms))
    }

    fn wait_inner(&self, timeout_ms: Option<u64>) -> Result<()> {
        stats::operation(ObjectKind::Event);
        let pid = sched::current_pid();

        {
            let mut st = self.state.lock();
            if st.signaled {
                if !st.manual_reset {
                    st.signaled = false;
                }
                return Ok(());
            }
            if timeout_ms == Some(0) {
                return Err(IpcError::Timeout);
            }
            let deadline = timeout_ms.map(|ms| sched::now_ticks() + ms);
            st.waiters.enqueue(pid, deadline, 0);
        }

        sched::block_task(pid);

        match wait::take_result(pid).0 {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::Timeout => Err(IpcError::Timeout),
            WaitStatus::Destroyed => Err(IpcError::InvalidHandle),
            WaitStatus::OwnerDead => Err(IpcError::OwnerDead),
        }
    }

    /// Signal the event.
    ///
    /// Manual-reset: wakes every waiter, stays signaled. Auto-reset: wakes
    /// at most one waiter and clears only if one was woken; with no waiter
    /// the signal is latched for the next `wait` to consume.
    pub fn signal(&self) -> Result<()> {
        stats::operation(ObjectKind::Event);
        let woken = {
            let mut st = self.state.lock();
            st.signaled = true;
            if st.manual_reset {
                st.waiters.wake(0, WaitStatus::Signaled, 0)
            } else if !st.waiters.is_empty() {
                let woken = st.waiters.wake(1, WaitStatus::Signaled, 0);
                st.signaled = false;
                woken
            } else {
                Vec::new()
            }
        };
        wait::unblock_all(&woken);
        notify_sets(self);
        Ok(())
    }

    /// Signal the event and wake every waiter. Auto-reset events clear
    /// after the wake.
    pub fn broadcast(&self) -> Result<()> {
        stats::operation(ObjectKind::Event);
        let woken = {
            let mut st = self.state.lock();
            st.signaled = true;
            let woken = st.waiters.wake(0, WaitStatus::Signaled, 0);
            if !st.manual_reset {
                st.signaled = false;
            }
            woken
        };
        wait::unblock_all(&woken);
        notify_sets(self);
        Ok(())
    }

    /// Clear the signaled state.
    pub fn reset(&self) -> Result<()> {
        stats::operation(ObjectKind::Event);
        self.state.lock().signaled = false;
        Ok(())
    }

    /// Whether the event is currently signaled. Advisory.
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Number of tasks blocked on this event. Advisory.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Wake one waiter on every set containing the freshly signaled event. The
/// cookie names the triggering event; the woken waiter re-scans under the
/// set lock, so the cookie is advisory.
fn notify_sets(event: &Event) {
    let sets: Vec<Arc<EventSet>> = EVENT_SETS.lock().clone();
    for set in sets {
        let woken = {
            let mut st = set.state.lock();
            let is_member = st
                .members
                .iter()
                .any(|m| m.header.id() == event.header.id());
            if is_member && !st.waiters.is_empty() {
                st.waiters.wake(1, WaitStatus::Signaled, event.header.id())
            } else {
                Vec::new()
            }
        };
        wait::unblock_all(&woken);
    }
}

/// Drop one protocol reference to an event, destroying it when none remain.
fn release_event(event: &Arc<Event>) {
    if event.header.release() == 0 {
        destroy_event_internal(event);
    }
}

/// Destroy an event. Only the creator or the kernel may destroy it; the
/// event lives on (with waiters intact) while an event set still holds it.
pub fn destroy_event(event: &Arc<Event>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != event.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    match event.header.release_owner_hold() {
        Some(0) => {
            destroy_event_internal(event);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped.
pub(crate) fn destroy_event_for_exit(event: &Arc<Event>) {
    destroy_event_internal(event);
}

fn destroy_event_internal(event: &Arc<Event>) {
    let woken = event.state.lock().waiters.wake(0, WaitStatus::Destroyed, 0);
    wait::unblock_all(&woken);
    EVENTS.lock().retain(|ev| !Arc::ptr_eq(ev, event));
    object::unregister(event.header.id());
    stats::object_destroyed(ObjectKind::Event);
    log::info!("destroyed event \"{}\"", event.header.name());
}

/// Create an event set holding up to `max_events` events.
pub fn create_event_set(name: &str, max_events: u32) -> Result<Arc<EventSet>> {
    if max_events == 0 || max_events as usize > MAX_EVENTS_PER_SET {
        return Err(IpcError::InvalidArgument);
    }
    let header = ObjectHeader::new(ObjectKind::EventSet, name, sched::current_pid())?;
    let set = Arc::new(EventSet {
        header,
        state: Spinlock::new(EventSetState {
            members: Vec::new(),
            capacity: max_events as usize,
            waiters: WaitQueue::new(),
        }),
    });
    EVENT_SETS.lock().push(set.clone());
    if let Err(e) = object::register(ObjectRef::EventSet(set.clone())) {
        EVENT_SETS.lock().retain(|s| !Arc::ptr_eq(s, &set));
        return Err(e);
    }
    log::info!(
        "created event set \"{}\" (capacity {})",
        set.header.name(),
        max_events
    );
    Ok(set)
}

impl EventSet {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Add an event to the set, taking a reference on it. Adding an event
    /// already in the set is a no-op.
    pub fn add(&self, event: &Arc<Event>) -> Result<()> {
        let mut st = self.state.lock();
        if st.members.iter().any(|m| Arc::ptr_eq(m, event)) {
            return Ok(());
        }
        if st.members.len() >= st.capacity {
            stats::allocation_failure();
            return Err(IpcError::OutOfMemory);
        }
        event.header.retain();
        st.members.push(event.clone());
        Ok(())
    }

    /// Remove an event from the set, dropping the set's reference on it.
    pub fn remove(&self, event: &Arc<Event>) -> Result<()> {
        {
            let mut st = self.state.lock();
            let Some(pos) = st.members.iter().position(|m| Arc::ptr_eq(m, event)) else {
                return Err(IpcError::InvalidArgument);
            };
            st.members.remove(pos);
        }
        release_event(event);
        Ok(())
    }

    /// Number of member events. Advisory.
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Block until any member event is signaled; returns that event.
    pub fn wait(&self) -> Result<Arc<Event>> {
        self.wait_inner(None)
    }

    /// Like [`EventSet::wait`] with an upper bound in milliseconds.
    pub fn timed_wait(&self, timeout_ms: u64) -> Result<Arc<Event>> {
        self.wait_inner(Some(timeout_ms))
    }

    fn wait_inner(&self, timeout_ms: Option<u64>) -> Result<Arc<Event>> {
        stats::operation(ObjectKind::EventSet);
        let pid = sched::current_pid();
        let deadline = timeout_ms.map(|ms| sched::now_ticks() + ms);

        loop {
            {
                let mut st = self.state.lock();
                if st.members.is_empty() {
                    return Err(IpcError::InvalidArgument);
                }
                // Scan members in array order; the set lock stays held
                // through the scan and the enqueue below, so a concurrent
                // signal either lands before the scan (and is found) or
                // after the enqueue (and wakes us).
                for ev in st.members.iter() {
                    let mut es = ev.state.lock();
                    if es.signaled {
                        if !es.manual_reset {
                            es.signaled = false;
                        }
                        let found = ev.clone();
                        drop(es);
                        return Ok(found);
                    }
                }
                if let Some(d) = deadline {
                    if sched::now_ticks() >= d {
                        return Err(IpcError::Timeout);
                    }
                }
                st.waiters.enqueue(pid, deadline, 0);
            }

            sched::block_task(pid);

            match wait::take_result(pid).0 {
                // The cookie names the triggering event, but another waiter
                // may have consumed it first; re-scan.
                WaitStatus::Signaled => continue,
                WaitStatus::Timeout => return Err(IpcError::Timeout),
                WaitStatus::Destroyed => return Err(IpcError::InvalidHandle),
                WaitStatus::OwnerDead => return Err(IpcError::OwnerDead),
            }
        }
    }

    /// Number of tasks blocked on the set. Advisory.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Destroy an event set. Only the creator or the kernel may destroy it.
/// Member events lose the set's reference and are destroyed if it was the
/// last one.
pub fn destroy_event_set(set: &Arc<EventSet>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != set.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    match set.header.release_owner_hold() {
        Some(0) => {
            destroy_event_set_internal(set);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped.
pub(crate) fn destroy_event_set_for_exit(set: &Arc<EventSet>) {
    destroy_event_set_internal(set);
}

fn destroy_event_set_internal(set: &Arc<EventSet>) {
    let (woken, members) = {
        let mut st = set.state.lock();
        let woken = st.waiters.wake(0, WaitStatus::Destroyed, 0);
        (woken, core::mem::take(&mut st.members))
    };
    wait::unblock_all(&woken);
    for ev in &members {
        release_event(ev);
    }
    EVENT_SETS.lock().retain(|s| !Arc::ptr_eq(s, set));
    object::unregister(set.header.id());
    stats::object_destroyed(ObjectKind::EventSet);
    log::info!("destroyed event set \"{}\"", set.header.name());
}

/// Task-exit hook: purge the task from every event and event-set wait
/// queue.
pub fn cleanup_task_events(pid: Pid) {
    let events: Vec<Arc<Event>> = EVENTS.lock().clone();
    for ev in events {
        ev.state.lock().waiters.remove(pid);
    }
    let sets: Vec<Arc<EventSet>> = EVENT_SETS.lock().clone();
    for set in sets {
        set.state.lock().waiters.remove(pid);
    }
}

/// Periodic deadline sweep over every event and event-set wait queue.
pub fn check_timeouts(now: u64) {
    let events: Vec<Arc<Event>> = EVENTS.lock().clone();
    for ev in events {
        let expired = ev.state.lock().waiters.sweep_deadlines(now);
        wait::unblock_all(&expired);
    }
    let sets: Vec<Arc<EventSet>> = EVENT_SETS.lock().clone();
    for set in sets {
        let expired = set.state.lock().waiters.sweep_deadlines(now);
        wait::unblock_all(&expired);
    }
}

/// Log every live event and event set.
pub fn dump_all_events() {
    let events = EVENTS.lock();
    for ev in events.iter() {
        let st = ev.state.lock();
        log::info!(
            "event \"{}\": {} {} waiters={}",
            ev.header.name(),
            if st.signaled { "SIGNALED" } else { "NONSIGNALED" },
            if st.manual_reset { "manual-reset" } else { "auto-reset" },
            st.waiters.len()
        );
    }
    drop(events);
    let sets = EVENT_SETS.lock();
    for set in sets.iter() {
        let st = set.state.lock();
        log::info!(
            "event set \"{}\": members={}/{} waiters={}",
            set.header.name(),
            st.members.len(),
            st.capacity,
            st.waiters.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::teststub;

    #[test]
    fn auto_reset_latches_signal_for_next_wait() {
        teststub::install_stub();
        teststub::set_current_pid(70);
        let ev = create_event("t_auto").unwrap();
        ev.signal().unwrap();
        assert!(ev.is_signaled(), "no waiter: signal latched");
        ev.wait().unwrap();
        assert!(!ev.is_signaled(), "wait consumed the signal");
        assert_eq!(ev.timed_wait(0), Err(IpcError::Timeout), "second wait finds nothing");
        destroy_event(&ev).unwrap();
    }

    #[test]
    fn manual_reset_stays_signaled_until_reset() {
        teststub::install_stub();
        teststub::set_current_pid(71);
        let ev = create_event_with("t_manual", EventFlags::MANUAL_RESET).unwrap();
        ev.signal().unwrap();
        ev.wait().unwrap();
        ev.wait().unwrap();
        assert!(ev.is_signaled());
        ev.reset().unwrap();
        assert_eq!(ev.timed_wait(0), Err(IpcError::Timeout));
        destroy_event(&ev).unwrap();
    }

    #[test]
    fn initially_set_flag() {
        teststub::install_stub();
        teststub::set_current_pid(72);
        let ev = create_event_with("t_initial", EventFlags::INITIALLY_SET).unwrap();
        ev.wait().unwrap();
        destroy_event(&ev).unwrap();
    }

    #[test]
    fn set_membership_tracks_refcount() {
        teststub::install_stub();
        teststub::set_current_pid(73);
        let ev = create_event("t_member").unwrap();
        let set = create_event_set("t_set", 4).unwrap();
        set.add(&ev).unwrap();
        assert_eq!(ev.header().ref_count(), 2);
        set.add(&ev).unwrap();
        assert_eq!(ev.header().ref_count(), 2, "re-add is a no-op");
        set.remove(&ev).unwrap();
        assert_eq!(ev.header().ref_count(), 1);
        assert_eq!(set.remove(&ev), Err(IpcError::InvalidArgument));
        destroy_event_set(&set).unwrap();
        destroy_event(&ev).unwrap();
    }

    #[test]
    fn set_capacity_is_enforced() {
        teststub::install_stub();
        teststub::set_current_pid(74);
        assert_eq!(
            create_event_set("t_cap0", 0).err(),
            Some(IpcError::InvalidArgument)
        );
        let set = create_event_set("t_cap", 1).unwrap();
        let a = create_event("t_cap_a").unwrap();
        let b = create_event("t_cap_b").unwrap();
        set.add(&a).unwrap();
        assert_eq!(set.add(&b), Err(IpcError::OutOfMemory));
        destroy_event_set(&set).unwrap();
        destroy_event(&a).unwrap();
        destroy_event(&b).unwrap();
    }

    #[test]
    fn set_wait_consumes_signaled_member() {
        teststub::install_stub();
        teststub::set_current_pid(75);
        let a = create_event("t_scan_a").unwrap();
        let b = create_event("t_scan_b").unwrap();
        let set = create_event_set("t_scan", 4).unwrap();
        set.add(&a).unwrap();
        set.add(&b).unwrap();

        b.signal().unwrap();
        let hit = set.timed_wait(0).unwrap();
        assert!(Arc::ptr_eq(&hit, &b));
        assert!(!b.is_signaled(), "auto-reset consumed by the set scan");
        assert_eq!(set.timed_wait(0).err(), Some(IpcError::Timeout));

        destroy_event_set(&set).unwrap();
        destroy_event(&a).unwrap();
        destroy_event(&b).unwrap();
    }

    #[test]
    fn destroying_set_releases_members() {
        teststub::install_stub();
        teststub::set_current_pid(76);
        let ev = create_event("t_cascade").unwrap();
        let set = create_event_set("t_cascade_set", 2).unwrap();
        set.add(&ev).unwrap();
        // Owner drops its hold first; the set keeps the event alive.
        destroy_event(&ev).unwrap();
        assert_eq!(ev.header().ref_count(), 1);
        // Destroying the set drops the last reference.
        destroy_event_set(&set).unwrap();
        assert_eq!(ev.header().ref_count(), 0);
    }
}
