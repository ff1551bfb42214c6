//! Common IPC object substrate: kind tags, names, headers, and the global
//! registry.
//!
//! Every IPC object starts with an [`ObjectHeader`] carrying its kind tag,
//! name, owner and protocol reference count. The registry holds one
//! [`ObjectRef`] per live object, a closed sum over the six kinds, so
//! destruction dispatch is a `match` instead of a function pointer and an
//! operation can never be applied to the wrong kind.
//!
//! Lock order: the registry lock is acquired strictly before any object
//! lock when both are needed; no object lock is ever held across a registry
//! call.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ipc::{event, message, mutex, semaphore, shared_memory, stats, IpcError, Result};
use crate::sched::Pid;
use crate::sync::Spinlock;

/// Maximum name length for IPC objects, in bytes.
pub const MAX_IPC_NAME_LENGTH: usize = 64;

/// System-wide cap on live IPC objects of all kinds.
pub const MAX_IPC_OBJECTS: usize = 1024;

/// The six IPC object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Mutex,
    Semaphore,
    Event,
    EventSet,
    MessageQueue,
    SharedMemory,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Mutex => "mutex",
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::Event => "event",
            ObjectKind::EventSet => "event_set",
            ObjectKind::MessageQueue => "message_queue",
            ObjectKind::SharedMemory => "shared_memory",
        }
    }
}

/// Fixed-capacity object name (≤ 64 bytes, not required to be unique).
#[derive(Clone, Copy)]
pub struct ObjectName {
    bytes: [u8; MAX_IPC_NAME_LENGTH],
    len: u8,
}

impl ObjectName {
    /// Build a name from a string. Empty or over-long names are refused.
    pub fn new(name: &str) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() > MAX_IPC_NAME_LENGTH {
            return Err(IpcError::InvalidArgument);
        }
        let mut bytes = [0u8; MAX_IPC_NAME_LENGTH];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(ObjectName {
            bytes,
            len: raw.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("<invalid>")
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}
impl Eq for ObjectName {}

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(1);

/// Common prefix of every IPC object.
pub struct ObjectHeader {
    id: u32,
    kind: ObjectKind,
    name: ObjectName,
    owner: Pid,
    ref_count: AtomicU32,
    owner_released: AtomicBool,
}

impl ObjectHeader {
    /// New header with reference count 1 (the creator's hold).
    pub fn new(kind: ObjectKind, name: &str, owner: Pid) -> Result<Self> {
        Ok(ObjectHeader {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: ObjectName::new(name)?,
            owner,
            ref_count: AtomicU32::new(1),
            owner_released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    /// PID of the creating task (`PID_KERNEL` for kernel objects).
    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Add one protocol reference (a new holder).
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one protocol reference; returns the remaining count. The caller
    /// destroys the object when this reaches zero.
    pub fn release(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Drop the creator's hold exactly once. Returns the remaining count,
    /// or `None` if the creator's hold was already released (e.g. by an
    /// earlier explicit destroy).
    pub(crate) fn release_owner_hold(&self) -> Option<u32> {
        if self
            .owner_released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            Some(self.release())
        } else {
            None
        }
    }
}

/// Typed reference to a live IPC object; the registry's entry type.
#[derive(Clone)]
pub enum ObjectRef {
    Mutex(Arc<mutex::Mutex>),
    Semaphore(Arc<semaphore::Semaphore>),
    Event(Arc<event::Event>),
    EventSet(Arc<event::EventSet>),
    MessageQueue(Arc<message::MessageQueue>),
    SharedMemory(Arc<shared_memory::ShmSegment>),
}

impl ObjectRef {
    pub fn header(&self) -> &ObjectHeader {
        match self {
            ObjectRef::Mutex(o) => o.header(),
            ObjectRef::Semaphore(o) => o.header(),
            ObjectRef::Event(o) => o.header(),
            ObjectRef::EventSet(o) => o.header(),
            ObjectRef::MessageQueue(o) => o.header(),
            ObjectRef::SharedMemory(o) => o.header(),
        }
    }
}

static REGISTRY: Spinlock<Vec<ObjectRef>> = Spinlock::new(Vec::new());

/// Place a newly created object in the registry. Fails only when the
/// system-wide object cap is exhausted.
pub fn register(obj: ObjectRef) -> Result<()> {
    let kind = obj.header().kind();
    {
        let mut reg = REGISTRY.lock();
        if reg.len() >= MAX_IPC_OBJECTS {
            stats::allocation_failure();
            return Err(IpcError::OutOfMemory);
        }
        reg.push(obj);
    }
    stats::object_created(kind);
    Ok(())
}

/// Remove a destroyed object from the registry. The destroy paths report
/// the kind themselves via [`stats::object_destroyed`].
pub fn unregister(id: u32) {
    REGISTRY.lock().retain(|o| o.header().id() != id);
}

/// References to every registered object created by `pid`.
pub fn owned_by(pid: Pid) -> Vec<ObjectRef> {
    REGISTRY
        .lock()
        .iter()
        .filter(|o| o.header().owner() == pid)
        .cloned()
        .collect()
}

/// Number of registered objects.
pub fn registered_count() -> usize {
    REGISTRY.lock().len()
}

/// Log every registered object: kind, name, refcount, owner.
pub fn dump_objects() {
    let reg = REGISTRY.lock();
    log::info!("===== IPC OBJECT DUMP ({} objects) =====", reg.len());
    for obj in reg.iter() {
        let h = obj.header();
        log::info!(
            "{} \"{}\" (id {}, refs {}, owner pid {})",
            h.kind().label(),
            h.name(),
            h.id(),
            h.ref_count(),
            h.owner()
        );
    }
}
