//! Task-to-queue registry.
//!
//! Maps each task to the message queues it owns (at most
//! [`MAX_TASK_QUEUES`]) with designated default send and receive queues, so
//! reply routing can find "the queue for PID x" without scanning the global
//! pool. The first queue a task registers becomes both defaults.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipc::message::{self, MessageQueue};
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid};
use crate::sync::Spinlock;

/// Maximum queues one task may register.
pub const MAX_TASK_QUEUES: usize = 16;

/// Maximum tasks the registry tracks.
pub const MAX_REGISTERED_TASKS: usize = 64;

/// Which of a task's queues a lookup should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLookup {
    /// The task's default send queue.
    Send,
    /// The task's default receive queue.
    Receive,
    /// Any queue (the first registered).
    Any,
}

struct RegistryEntry {
    task: Pid,
    queues: Vec<Arc<MessageQueue>>,
    send_idx: usize,
    recv_idx: usize,
}

static TASK_REGISTRY: Spinlock<Vec<RegistryEntry>> = Spinlock::new(Vec::new());

/// Associate a queue with a task. Registering the same queue twice is a
/// no-op; the first queue becomes the default for both directions.
pub fn register_task_queue(pid: Pid, queue: &Arc<MessageQueue>) -> Result<()> {
    let mut reg = TASK_REGISTRY.lock();

    let idx = match reg.iter().position(|e| e.task == pid) {
        Some(i) => i,
        None => {
            if reg.len() >= MAX_REGISTERED_TASKS {
                stats::allocation_failure();
                return Err(IpcError::OutOfMemory);
            }
            reg.push(RegistryEntry {
                task: pid,
                queues: Vec::new(),
                send_idx: 0,
                recv_idx: 0,
            });
            reg.len() - 1
        }
    };
    let entry = &mut reg[idx];

    if entry.queues.iter().any(|q| Arc::ptr_eq(q, queue)) {
        return Ok(());
    }
    if entry.queues.len() >= MAX_TASK_QUEUES {
        stats::allocation_failure();
        return Err(IpcError::OutOfMemory);
    }
    entry.queues.push(queue.clone());
    Ok(())
}

/// Detach a queue from a task, repairing the default indices.
pub fn unregister_task_queue(pid: Pid, queue: &Arc<MessageQueue>) {
    let mut reg = TASK_REGISTRY.lock();
    if let Some(entry) = reg.iter_mut().find(|e| e.task == pid) {
        if let Some(pos) = entry.queues.iter().position(|q| Arc::ptr_eq(q, queue)) {
            entry.queues.remove(pos);
            if entry.send_idx >= entry.queues.len() {
                entry.send_idx = 0;
            }
            if entry.recv_idx >= entry.queues.len() {
                entry.recv_idx = 0;
            }
        }
    }
}

/// Look up a queue for the given task.
pub fn find_task_queue(pid: Pid, mode: QueueLookup) -> Option<Arc<MessageQueue>> {
    let reg = TASK_REGISTRY.lock();
    let entry = reg.iter().find(|e| e.task == pid)?;
    if entry.queues.is_empty() {
        return None;
    }
    let idx = match mode {
        QueueLookup::Send => entry.send_idx,
        QueueLookup::Receive => entry.recv_idx,
        QueueLookup::Any => 0,
    };
    entry.queues.get(idx).cloned()
}

/// Look up a queue for the calling task.
pub fn current_task_queue(mode: QueueLookup) -> Option<Arc<MessageQueue>> {
    find_task_queue(sched::current_pid(), mode)
}

/// Make `queue` the task's default for the given direction (`Any` sets
/// both). The queue must already be registered for the task.
pub fn set_default_queue(pid: Pid, queue: &Arc<MessageQueue>, mode: QueueLookup) -> Result<()> {
    let mut reg = TASK_REGISTRY.lock();
    let entry = reg
        .iter_mut()
        .find(|e| e.task == pid)
        .ok_or(IpcError::InvalidHandle)?;
    let idx = entry
        .queues
        .iter()
        .position(|q| Arc::ptr_eq(q, queue))
        .ok_or(IpcError::InvalidHandle)?;
    match mode {
        QueueLookup::Send => entry.send_idx = idx,
        QueueLookup::Receive => entry.recv_idx = idx,
        QueueLookup::Any => {
            entry.send_idx = idx;
            entry.recv_idx = idx;
        }
    }
    Ok(())
}

/// Create a message queue and register it for `owner` in one step.
pub fn create_task_message_queue(
    name: &str,
    capacity: u32,
    owner: Pid,
) -> Result<Arc<MessageQueue>> {
    let queue = message::create_message_queue(name, capacity)?;
    register_task_queue(owner, &queue)?;
    Ok(queue)
}

/// Drop a task's registry entry. The queues themselves are owned by the
/// message subsystem and are destroyed there.
pub fn cleanup_task_queues(pid: Pid) {
    TASK_REGISTRY.lock().retain(|e| e.task != pid);
}

/// Remove a destroyed queue from every entry that references it.
pub(crate) fn purge_queue(queue: &Arc<MessageQueue>) {
    let mut reg = TASK_REGISTRY.lock();
    for entry in reg.iter_mut() {
        if let Some(pos) = entry.queues.iter().position(|q| Arc::ptr_eq(q, queue)) {
            entry.queues.remove(pos);
            if entry.send_idx >= entry.queues.len() {
                entry.send_idx = 0;
            }
            if entry.recv_idx >= entry.queues.len() {
                entry.recv_idx = 0;
            }
        }
    }
}

/// Log the registry contents.
pub fn dump_queue_registry() {
    let reg = TASK_REGISTRY.lock();
    log::info!("===== Message Queue Registry ({} tasks) =====", reg.len());
    for entry in reg.iter() {
        log::info!(
            "task {}: {} queue(s), send default #{}, receive default #{}",
            entry.task,
            entry.queues.len(),
            entry.send_idx,
            entry.recv_idx
        );
    }
}
