//! Inter-process communication subsystem.
//!
//! Six coordinated object kinds (mutex, semaphore, event, event set,
//! message queue, shared-memory segment) over a common substrate of
//! object headers, a global registry, wait queues, and atomic statistics.
//!
//! [`init`] wires the subsystems in dependency order and installs two
//! scheduler hooks: the periodic timeout sweep ([`check_ipc_timeouts`]) and
//! the task-exit cleanup ([`cleanup_task`]). All operations run in the
//! caller's task context; every blocking operation releases its object lock
//! before suspending and re-evaluates on resume.

pub mod event;
pub mod message;
pub mod mutex;
pub mod object;
pub mod queue_registry;
pub mod semaphore;
pub mod shared_memory;
pub mod stats;
pub mod wait;

use alloc::format;
use alloc::string::String;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sched::{self, Pid};
use crate::sync::Spinlock;

/// Error taxonomy shared by every IPC operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// Null, zero, or out-of-range input.
    InvalidArgument,
    /// Wrong kind tag or destroyed object.
    InvalidHandle,
    /// Caller may not perform the operation (non-owner destroy, perms
    /// intersection empty).
    PermissionDenied,
    /// A `try_*` operation found the object contended.
    Busy,
    /// A timed wait expired.
    Timeout,
    /// Semaphore value already at its maximum.
    Overflow,
    /// Non-blocking send found the queue full.
    QueueFull,
    /// Non-blocking receive found the queue empty.
    QueueEmpty,
    /// Reply target has no routable queue.
    NoRoute,
    /// Woken because the mutex owner exited.
    OwnerDead,
    /// Allocator exhaustion or a capacity cap.
    OutOfMemory,
    /// Shared-memory name already exists (exclusive create).
    NameCollision,
    /// Segment already mapped by the calling task.
    AlreadyMapped,
    /// Resize attempted without the resize flag.
    NoResize,
    /// No mapping at the given address.
    InvalidAddress,
    /// The queue was destroyed while the caller was blocked on it.
    QueueDestroyed,
    /// Substrate initialisation failed; the kernel cannot continue.
    Fatal,
}

impl IpcError {
    pub fn as_str(self) -> &'static str {
        match self {
            IpcError::InvalidArgument => "invalid argument",
            IpcError::InvalidHandle => "invalid handle",
            IpcError::PermissionDenied => "permission denied",
            IpcError::Busy => "busy",
            IpcError::Timeout => "timeout",
            IpcError::Overflow => "overflow",
            IpcError::QueueFull => "queue full",
            IpcError::QueueEmpty => "queue empty",
            IpcError::NoRoute => "no route",
            IpcError::OwnerDead => "owner dead",
            IpcError::OutOfMemory => "out of memory",
            IpcError::NameCollision => "name collision",
            IpcError::AlreadyMapped => "already mapped",
            IpcError::NoResize => "resize not permitted",
            IpcError::InvalidAddress => "invalid address",
            IpcError::QueueDestroyed => "queue destroyed",
            IpcError::Fatal => "fatal",
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type of every IPC operation.
pub type Result<T> = core::result::Result<T, IpcError>;

static MUTEX_READY: AtomicBool = AtomicBool::new(false);
static SEMAPHORE_READY: AtomicBool = AtomicBool::new(false);
static EVENT_READY: AtomicBool = AtomicBool::new(false);
static MESSAGE_READY: AtomicBool = AtomicBool::new(false);
static SHM_READY: AtomicBool = AtomicBool::new(false);
static HOOKS_READY: AtomicBool = AtomicBool::new(false);

static LAST_ERROR: Spinlock<Option<String>> = Spinlock::new(None);

/// Record a diagnostic for [`last_error`].
pub(crate) fn record_error(msg: String) {
    log::error!("IPC: {msg}");
    *LAST_ERROR.lock() = Some(msg);
}

/// Human-readable description of the most recent recorded IPC failure.
pub fn last_error() -> Option<String> {
    LAST_ERROR.lock().clone()
}

/// Initialise all IPC subsystems in dependency order and register the
/// scheduler hooks. Idempotent; returns `Fatal` when a collaborator is
/// missing.
pub fn init() -> Result<()> {
    if !sched::installed() {
        record_error(String::from("cannot init IPC: scheduler collaborator missing"));
        return Err(IpcError::Fatal);
    }
    if !crate::memory::ops::installed() {
        record_error(String::from("cannot init IPC: memory collaborator missing"));
        return Err(IpcError::Fatal);
    }

    log::info!("Initializing EdgeX IPC subsystems...");

    // Primitives first: everything above them blocks through their wait
    // queues.
    MUTEX_READY.store(true, Ordering::Release);
    log::info!("mutex subsystem ready");
    SEMAPHORE_READY.store(true, Ordering::Release);
    log::info!("semaphore subsystem ready");
    EVENT_READY.store(true, Ordering::Release);
    log::info!(
        "event subsystem ready (event sets up to {} members)",
        event::MAX_EVENTS_PER_SET
    );
    MESSAGE_READY.store(true, Ordering::Release);
    log::info!(
        "message subsystem ready (up to {} queues)",
        message::MAX_QUEUES
    );
    SHM_READY.store(true, Ordering::Release);
    log::info!(
        "shared memory subsystem ready (up to {} segments)",
        shared_memory::MAX_SHM_SEGMENTS
    );

    if !HOOKS_READY.swap(true, Ordering::AcqRel) {
        sched::register_timer_hook(check_ipc_timeouts);
        sched::register_task_exit_hook(cleanup_task);
    }

    log::info!("IPC subsystems initialized");
    Ok(())
}

/// Periodic hook: sweep every wait queue for expired deadlines and mark
/// stale synchronous messages. Runs from the timer tick.
pub fn check_ipc_timeouts() {
    let now = sched::now_ticks();
    mutex::check_timeouts(now);
    semaphore::check_timeouts(now);
    event::check_timeouts(now);
    message::check_timeouts(now);
}

/// Task-exit hook: release every IPC resource the terminated task owned or
/// held.
///
/// Order matters: locks first (so nothing below deadlocks on a dead
/// owner), then the higher-level constructs, then destruction of the
/// task's own objects whose refcount drains to zero.
pub fn cleanup_task(pid: Pid) {
    mutex::cleanup_task_mutexes(pid);
    semaphore::cleanup_task_semaphores(pid);
    event::cleanup_task_events(pid);
    message::cleanup_task_messages(pid);
    queue_registry::cleanup_task_queues(pid);
    shared_memory::cleanup_task_shared_memory(pid);

    // Destroy the task's own objects. The creator hold is dropped exactly
    // once per object; anything another task still references stays alive.
    for obj in object::owned_by(pid) {
        match obj {
            object::ObjectRef::Mutex(m) => {
                if let Some(0) = m.header().release_owner_hold() {
                    mutex::destroy_for_exit(&m);
                }
            }
            object::ObjectRef::Semaphore(s) => {
                if let Some(0) = s.header().release_owner_hold() {
                    semaphore::destroy_for_exit(&s);
                }
            }
            object::ObjectRef::Event(e) => {
                if let Some(0) = e.header().release_owner_hold() {
                    event::destroy_event_for_exit(&e);
                }
            }
            object::ObjectRef::EventSet(s) => {
                if let Some(0) = s.header().release_owner_hold() {
                    event::destroy_event_set_for_exit(&s);
                }
            }
            object::ObjectRef::MessageQueue(q) => {
                if let Some(0) = q.header().release_owner_hold() {
                    message::destroy_for_exit(&q);
                }
            }
            object::ObjectRef::SharedMemory(s) => {
                if let Some(0) = s.header().release_owner_hold() {
                    shared_memory::destroy_for_exit(&s);
                }
            }
        }
    }

    wait::clear_result(pid);
    log::info!("cleaned up IPC resources of terminated task {pid}");
}

/// Health check: all subsystems initialised, no runaway leak, error
/// counters within bounds.
pub fn check_health() -> bool {
    let mut healthy = true;

    for (ready, name) in [
        (&MUTEX_READY, "mutex"),
        (&SEMAPHORE_READY, "semaphore"),
        (&EVENT_READY, "event"),
        (&MESSAGE_READY, "message"),
        (&SHM_READY, "shared memory"),
    ] {
        if !ready.load(Ordering::Acquire) {
            record_error(format!("{name} subsystem not initialized"));
            healthy = false;
        }
    }

    let s = stats::get();
    if s.objects_created > s.objects_destroyed + 100 {
        record_error(format!(
            "possible IPC object leak: {} created, {} destroyed",
            s.objects_created, s.objects_destroyed
        ));
        healthy = false;
    }
    if s.allocation_failures > 10 {
        record_error(format!(
            "excessive allocation failures: {}",
            s.allocation_failures
        ));
        healthy = false;
    }

    healthy
}

/// Log every live IPC object of every kind.
pub fn dump_ipc_objects() {
    object::dump_objects();
    mutex::dump_all_mutexes();
    semaphore::dump_all_semaphores();
    event::dump_all_events();
    message::dump_all_message_queues();
    shared_memory::dump_all_shared_memory();
    queue_registry::dump_queue_registry();
}
