//! IPC subsystem statistics.
//!
//! All counters are plain atomics; no lock is ever taken to update a
//! statistic. Snapshots are advisory (fields are read one by one, not
//! atomically as a group).

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ipc::object::ObjectKind;

struct Counters {
    objects_created: AtomicU64,
    objects_destroyed: AtomicU64,

    mutex_count: AtomicU32,
    semaphore_count: AtomicU32,
    event_count: AtomicU32,
    event_set_count: AtomicU32,
    message_queue_count: AtomicU32,
    shared_memory_count: AtomicU32,

    mutex_operations: AtomicU64,
    semaphore_operations: AtomicU64,
    event_operations: AtomicU64,
    message_operations: AtomicU64,
    shared_memory_operations: AtomicU64,

    active_waiters: AtomicU32,
    timeouts: AtomicU32,

    allocation_failures: AtomicU32,
    permission_failures: AtomicU32,
    timeout_failures: AtomicU32,

    cow_breaks: AtomicU64,
}

static STATS: Counters = Counters {
    objects_created: AtomicU64::new(0),
    objects_destroyed: AtomicU64::new(0),
    mutex_count: AtomicU32::new(0),
    semaphore_count: AtomicU32::new(0),
    event_count: AtomicU32::new(0),
    event_set_count: AtomicU32::new(0),
    message_queue_count: AtomicU32::new(0),
    shared_memory_count: AtomicU32::new(0),
    mutex_operations: AtomicU64::new(0),
    semaphore_operations: AtomicU64::new(0),
    event_operations: AtomicU64::new(0),
    message_operations: AtomicU64::new(0),
    shared_memory_operations: AtomicU64::new(0),
    active_waiters: AtomicU32::new(0),
    timeouts: AtomicU32::new(0),
    allocation_failures: AtomicU32::new(0),
    permission_failures: AtomicU32::new(0),
    timeout_failures: AtomicU32::new(0),
    cow_breaks: AtomicU64::new(0),
};

/// Point-in-time snapshot of the IPC counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct IpcStats {
    pub objects_created: u64,
    pub objects_destroyed: u64,

    pub mutex_count: u32,
    pub semaphore_count: u32,
    pub event_count: u32,
    pub event_set_count: u32,
    pub message_queue_count: u32,
    pub shared_memory_count: u32,

    pub mutex_operations: u64,
    pub semaphore_operations: u64,
    pub event_operations: u64,
    pub message_operations: u64,
    pub shared_memory_operations: u64,

    pub active_waiters: u32,
    pub timeouts: u32,

    pub allocation_failures: u32,
    pub permission_failures: u32,
    pub timeout_failures: u32,

    pub cow_breaks: u64,
}

fn kind_count(kind: ObjectKind) -> &'static AtomicU32 {
    match kind {
        ObjectKind::Mutex => &STATS.mutex_count,
        ObjectKind::Semaphore => &STATS.semaphore_count,
        ObjectKind::Event => &STATS.event_count,
        ObjectKind::EventSet => &STATS.event_set_count,
        ObjectKind::MessageQueue => &STATS.message_queue_count,
        ObjectKind::SharedMemory => &STATS.shared_memory_count,
    }
}

fn kind_operations(kind: ObjectKind) -> &'static AtomicU64 {
    match kind {
        ObjectKind::Mutex => &STATS.mutex_operations,
        ObjectKind::Semaphore => &STATS.semaphore_operations,
        ObjectKind::Event | ObjectKind::EventSet => &STATS.event_operations,
        ObjectKind::MessageQueue => &STATS.message_operations,
        ObjectKind::SharedMemory => &STATS.shared_memory_operations,
    }
}

/// Record creation of an IPC object of the given kind.
pub fn object_created(kind: ObjectKind) {
    STATS.objects_created.fetch_add(1, Ordering::Relaxed);
    kind_count(kind).fetch_add(1, Ordering::Relaxed);
}

/// Record destruction of an IPC object of the given kind.
pub fn object_destroyed(kind: ObjectKind) {
    STATS.objects_destroyed.fetch_add(1, Ordering::Relaxed);
    kind_count(kind).fetch_sub(1, Ordering::Relaxed);
}

/// Record one operation on an object of the given kind.
pub fn operation(kind: ObjectKind) {
    kind_operations(kind).fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn waiter_enqueued() {
    STATS.active_waiters.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn waiter_removed() {
    STATS.active_waiters.fetch_sub(1, Ordering::Relaxed);
}

/// Record a wait that ended because its deadline expired.
pub(crate) fn timeout_expired() {
    STATS.timeouts.fetch_add(1, Ordering::Relaxed);
    STATS.timeout_failures.fetch_add(1, Ordering::Relaxed);
}

/// Record a failed allocation inside an IPC operation.
pub(crate) fn allocation_failure() {
    STATS.allocation_failures.fetch_add(1, Ordering::Relaxed);
}

/// Record a permission-denied refusal.
pub(crate) fn permission_failure() {
    STATS.permission_failures.fetch_add(1, Ordering::Relaxed);
}

/// Record a COW share broken by a write fault.
pub(crate) fn cow_break() {
    STATS.cow_breaks.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot the current statistics.
pub fn get() -> IpcStats {
    IpcStats {
        objects_created: STATS.objects_created.load(Ordering::Relaxed),
        objects_destroyed: STATS.objects_destroyed.load(Ordering::Relaxed),
        mutex_count: STATS.mutex_count.load(Ordering::Relaxed),
        semaphore_count: STATS.semaphore_count.load(Ordering::Relaxed),
        event_count: STATS.event_count.load(Ordering::Relaxed),
        event_set_count: STATS.event_set_count.load(Ordering::Relaxed),
        message_queue_count: STATS.message_queue_count.load(Ordering::Relaxed),
        shared_memory_count: STATS.shared_memory_count.load(Ordering::Relaxed),
        mutex_operations: STATS.mutex_operations.load(Ordering::Relaxed),
        semaphore_operations: STATS.semaphore_operations.load(Ordering::Relaxed),
        event_operations: STATS.event_operations.load(Ordering::Relaxed),
        message_operations: STATS.message_operations.load(Ordering::Relaxed),
        shared_memory_operations: STATS.shared_memory_operations.load(Ordering::Relaxed),
        active_waiters: STATS.active_waiters.load(Ordering::Relaxed),
        timeouts: STATS.timeouts.load(Ordering::Relaxed),
        allocation_failures: STATS.allocation_failures.load(Ordering::Relaxed),
        permission_failures: STATS.permission_failures.load(Ordering::Relaxed),
        timeout_failures: STATS.timeout_failures.load(Ordering::Relaxed),
        cow_breaks: STATS.cow_breaks.load(Ordering::Relaxed),
    }
}

/// Reset operation, wait, and error counters. Object counts are kept: they
/// reflect current system state, not history.
pub fn reset() {
    STATS.mutex_operations.store(0, Ordering::Relaxed);
    STATS.semaphore_operations.store(0, Ordering::Relaxed);
    STATS.event_operations.store(0, Ordering::Relaxed);
    STATS.message_operations.store(0, Ordering::Relaxed);
    STATS.shared_memory_operations.store(0, Ordering::Relaxed);
    STATS.timeouts.store(0, Ordering::Relaxed);
    STATS.allocation_failures.store(0, Ordering::Relaxed);
    STATS.permission_failures.store(0, Ordering::Relaxed);
    STATS.timeout_failures.store(0, Ordering::Relaxed);
    log::info!("IPC statistics reset");
}

/// Log a formatted summary of all counters.
pub fn print_stats() {
    let s = get();
    log::info!("===== IPC SUBSYSTEM STATISTICS =====");
    log::info!(
        "objects: {} created, {} destroyed",
        s.objects_created,
        s.objects_destroyed
    );
    log::info!(
        "live: {} mutex, {} sem, {} event, {} event-set, {} queue, {} shm",
        s.mutex_count,
        s.semaphore_count,
        s.event_count,
        s.event_set_count,
        s.message_queue_count,
        s.shared_memory_count
    );
    log::info!(
        "ops: {} mutex, {} sem, {} event, {} message, {} shm",
        s.mutex_operations,
        s.semaphore_operations,
        s.event_operations,
        s.message_operations,
        s.shared_memory_operations
    );
    log::info!(
        "waits: {} active, {} timeouts; cow breaks: {}",
        s.active_waiters,
        s.timeouts,
        s.cow_breaks
    );
    log::info!(
        "errors: {} alloc, {} permission, {} timeout",
        s.allocation_failures,
        s.permission_failures,
        s.timeout_failures
    );
}

