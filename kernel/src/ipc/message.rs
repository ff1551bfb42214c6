//! Message queues: priority-ordered, bounded, wire-exact messages.
//!
//! A queue is a bounded buffer of fixed-layout messages ordered by
//! descending priority (FIFO within one priority). Slot accounting uses two
//! embedded counting semaphores, `free_slots` (starts at capacity) and
//! `used_slots` (starts at zero), so blocking send/receive fall out of the
//! semaphore handoff discipline. At every quiescent point
//! `current_size == used_slots` and `capacity - current_size == free_slots`.
//!
//! Wire layout (little-endian, packed):
//!
//! ```text
//! offset  size  field
//! 0       4     id
//! 4       4     sender_pid
//! 8       4     receiver_pid
//! 12      4     kind
//! 16      4     priority
//! 20      4     flags
//! 24      4     size (0..1024)
//! 28      4     reply_id
//! 32      8     timestamp_ms
//! 40      N     payload (N == size; zero-padded to 1024 in memory)
//! ```

use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ipc::object::{self, ObjectHeader, ObjectKind, ObjectRef};
use crate::ipc::queue_registry::{self, QueueLookup};
use crate::ipc::semaphore::Semaphore;
use crate::ipc::wait::WaitStatus;
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid, PID_KERNEL};
use crate::sync::Spinlock;

/// Maximum payload size of a single message in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Queue capacity used when `create_message_queue` is passed zero.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 64;

/// System-wide cap on live message queues.
pub const MAX_QUEUES: usize = 256;

/// Timeout applied to blocking operations carrying [`MessageFlags::TIMED`]
/// without an explicit timeout.
pub const QUEUE_TIMEOUT_MS: u64 = 5000;

/// Age at which a pending `SYNC` message is marked timed out by the sweep.
const SYNC_STALE_MS: u64 = 30_000;

/// Length of the packed wire header preceding the payload.
pub const WIRE_HEADER_LEN: usize = 40;

/// Message kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    Normal = 0,
    Control = 1,
    Response = 2,
    Error = 3,
    System = 4,
}

impl MessageKind {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => MessageKind::Normal,
            1 => MessageKind::Control,
            2 => MessageKind::Response,
            3 => MessageKind::Error,
            4 => MessageKind::System,
            _ => return Err(IpcError::InvalidArgument),
        })
    }
}

/// Message delivery priority. Queues deliver strictly by descending
/// priority, FIFO within one level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl MessagePriority {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => MessagePriority::Low,
            1 => MessagePriority::Normal,
            2 => MessagePriority::High,
            3 => MessagePriority::Urgent,
            _ => return Err(IpcError::InvalidArgument),
        })
    }
}

bitflags! {
    /// Send/receive behavior flags (wire `flags` field).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MessageFlags: u32 {
        /// Fail with `QueueFull`/`QueueEmpty` instead of blocking.
        const NONBLOCK = 1 << 0;
        /// Do not wait for a reply after a `SYNC` send.
        const NOWAIT   = 1 << 1;
        /// Force head-of-queue insertion regardless of priority.
        const URGENT   = 1 << 2;
        /// Sender expects a reply correlated via `reply_id`.
        const SYNC     = 1 << 3;
        /// Apply the default queue timeout to the blocking phase.
        const TIMED    = 1 << 4;
        /// Set by the sweep on `SYNC` messages nobody answered in time.
        const TIMED_OUT = 1 << 31;
    }
}

/// Fixed-layout message header (wire order, see module docs).
#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    pub id: u32,
    pub sender: Pid,
    pub receiver: Pid,
    pub kind: MessageKind,
    pub priority: MessagePriority,
    pub flags: MessageFlags,
    pub size: u32,
    pub reply_id: u32,
    pub timestamp_ms: u64,
}

/// A message: header plus payload, padded to [`MAX_MESSAGE_SIZE`] in memory.
#[derive(Clone)]
pub struct Message {
    pub header: MessageHeader,
    payload: [u8; MAX_MESSAGE_SIZE],
}

impl Message {
    /// Build a message for `receiver`. `id`, `sender` and `timestamp_ms`
    /// are assigned at send time.
    pub fn new(
        receiver: Pid,
        kind: MessageKind,
        priority: MessagePriority,
        payload: &[u8],
    ) -> Result<Message> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::InvalidArgument);
        }
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Message {
            header: MessageHeader {
                id: 0,
                sender: 0,
                receiver,
                kind,
                priority,
                flags: MessageFlags::empty(),
                size: payload.len() as u32,
                reply_id: 0,
                timestamp_ms: 0,
            },
            payload: buf,
        })
    }

    /// The live payload bytes (`size` of them).
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.header.size as usize]
    }

    /// Serialize to the packed little-endian wire form
    /// (`WIRE_HEADER_LEN + size` bytes).
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(WIRE_HEADER_LEN + h.size as usize);
        out.extend_from_slice(&h.id.to_le_bytes());
        out.extend_from_slice(&h.sender.to_le_bytes());
        out.extend_from_slice(&h.receiver.to_le_bytes());
        out.extend_from_slice(&(h.kind as u32).to_le_bytes());
        out.extend_from_slice(&(h.priority as u32).to_le_bytes());
        out.extend_from_slice(&h.flags.bits().to_le_bytes());
        out.extend_from_slice(&h.size.to_le_bytes());
        out.extend_from_slice(&h.reply_id.to_le_bytes());
        out.extend_from_slice(&h.timestamp_ms.to_le_bytes());
        out.extend_from_slice(self.payload());
        out
    }

    /// Parse a message from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Message> {
        if bytes.len() < WIRE_HEADER_LEN {
            return Err(IpcError::InvalidArgument);
        }
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let size = u32_at(24);
        if size as usize > MAX_MESSAGE_SIZE || bytes.len() < WIRE_HEADER_LEN + size as usize {
            return Err(IpcError::InvalidArgument);
        }
        let mut payload = [0u8; MAX_MESSAGE_SIZE];
        payload[..size as usize]
            .copy_from_slice(&bytes[WIRE_HEADER_LEN..WIRE_HEADER_LEN + size as usize]);
        Ok(Message {
            header: MessageHeader {
                id: u32_at(0),
                sender: u32_at(4),
                receiver: u32_at(8),
                kind: MessageKind::from_u32(u32_at(12))?,
                priority: MessagePriority::from_u32(u32_at(16))?,
                flags: MessageFlags::from_bits_retain(u32_at(20)),
                size,
                reply_id: u32_at(28),
                timestamp_ms: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            },
            payload,
        })
    }
}

struct QueueState {
    messages: VecDeque<Message>,
    capacity: usize,
    high_count: u32,
    urgent_count: u32,
    destroyed: bool,
}

#[derive(Default)]
struct QueueCounters {
    sent: AtomicU64,
    received: AtomicU64,
    blocked_sends: AtomicU64,
    blocked_receives: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
}

/// Per-queue statistics snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    pub sent: u64,
    pub received: u64,
    pub blocked_sends: u64,
    pub blocked_receives: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub current_size: usize,
    pub high_count: u32,
    pub urgent_count: u32,
}

/// A bounded, priority-ordered message queue.
pub struct MessageQueue {
    header: ObjectHeader,
    free_slots: Semaphore,
    used_slots: Semaphore,
    state: Spinlock<QueueState>,
    counters: QueueCounters,
}

static QUEUES: Spinlock<Vec<Arc<MessageQueue>>> = Spinlock::new(Vec::new());
static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Create a message queue with the given capacity (0 = default), register
/// it, and return the typed handle.
pub fn create_message_queue(name: &str, capacity: u32) -> Result<Arc<MessageQueue>> {
    let capacity = if capacity == 0 { DEFAULT_QUEUE_CAPACITY } else { capacity };

    if QUEUES.lock().len() >= MAX_QUEUES {
        stats::allocation_failure();
        log::error!("maximum number of message queues reached");
        return Err(IpcError::OutOfMemory);
    }

    let header = ObjectHeader::new(ObjectKind::MessageQueue, name, sched::current_pid())?;
    let queue = Arc::new(MessageQueue {
        header,
        free_slots: Semaphore::embedded(&format!("{name}_free"), capacity as i32, capacity as i32)?,
        used_slots: Semaphore::embedded(&format!("{name}_used"), 0, capacity as i32)?,
        state: Spinlock::new(QueueState {
            messages: VecDeque::new(),
            capacity: capacity as usize,
            high_count: 0,
            urgent_count: 0,
            destroyed: false,
        }),
        counters: QueueCounters::default(),
    });

    QUEUES.lock().push(queue.clone());
    if let Err(e) = object::register(ObjectRef::MessageQueue(queue.clone())) {
        QUEUES.lock().retain(|q| !Arc::ptr_eq(q, &queue));
        return Err(e);
    }
    log::info!(
        "created message queue \"{}\" with capacity {}",
        queue.header.name(),
        capacity
    );
    Ok(queue)
}

/// Insert keeping the deque sorted by descending priority, FIFO within one
/// level: the new message goes right after the last message of equal or
/// higher priority.
fn insert_by_priority(messages: &mut VecDeque<Message>, msg: Message) {
    let p = msg.header.priority;
    let idx = messages
        .iter()
        .rposition(|m| m.header.priority >= p)
        .map(|i| i + 1)
        .unwrap_or(0);
    messages.insert(idx, msg);
}

impl MessageQueue {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of queued messages. Advisory.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(used_slots, free_slots)` semaphore values. Advisory.
    pub fn slot_values(&self) -> (i32, i32) {
        (self.used_slots.value(), self.free_slots.value())
    }

    /// Send a message. Blocking unless `NONBLOCK`; `TIMED` bounds the wait
    /// by [`QUEUE_TIMEOUT_MS`]. Returns the assigned message id.
    pub fn send(&self, msg: Message, flags: MessageFlags) -> Result<u32> {
        let timeout = flags.contains(MessageFlags::TIMED).then_some(QUEUE_TIMEOUT_MS);
        self.send_inner(msg, flags, timeout)
    }

    /// Send with an explicit bound on the blocking phase.
    pub fn send_timeout(&self, msg: Message, flags: MessageFlags, timeout_ms: u64) -> Result<u32> {
        self.send_inner(msg, flags, Some(timeout_ms))
    }

    fn send_inner(
        &self,
        mut msg: Message,
        flags: MessageFlags,
        timeout_ms: Option<u64>,
    ) -> Result<u32> {
        stats::operation(ObjectKind::MessageQueue);
        if msg.header.size as usize > MAX_MESSAGE_SIZE {
            return Err(IpcError::InvalidArgument);
        }

        msg.header.sender = sched::current_pid();
        msg.header.id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst);
        msg.header.timestamp_ms = sched::now_ticks();
        msg.header.flags = flags;
        let id = msg.header.id;

        // Acquire a slot.
        if self.free_slots.try_wait().is_err() {
            if flags.contains(MessageFlags::NONBLOCK) {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(IpcError::QueueFull);
            }
            self.counters.blocked_sends.fetch_add(1, Ordering::Relaxed);
            let waited = match timeout_ms {
                Some(ms) => self.free_slots.wait_timeout(ms),
                None => self.free_slots.wait(),
            };
            match waited {
                Ok(()) => {}
                Err(IpcError::Timeout) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(IpcError::Timeout);
                }
                Err(IpcError::InvalidHandle) => return Err(IpcError::QueueDestroyed),
                Err(e) => return Err(e),
            }
        }

        {
            let mut st = self.state.lock();
            if st.destroyed {
                return Err(IpcError::QueueDestroyed);
            }
            match msg.header.priority {
                MessagePriority::Urgent => st.urgent_count += 1,
                MessagePriority::High => st.high_count += 1,
                _ => {}
            }
            if flags.contains(MessageFlags::URGENT) {
                st.messages.push_front(msg);
            } else {
                insert_by_priority(&mut st.messages, msg);
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
        }

        let _ = self.used_slots.post();
        Ok(id)
    }

    /// Receive the earliest highest-priority message. Blocking unless
    /// `NONBLOCK`; `TIMED` bounds the wait by [`QUEUE_TIMEOUT_MS`].
    pub fn receive(&self, flags: MessageFlags) -> Result<Message> {
        let timeout = flags.contains(MessageFlags::TIMED).then_some(QUEUE_TIMEOUT_MS);
        self.receive_inner(flags, timeout)
    }

    /// Receive with an explicit bound on the blocking phase.
    pub fn receive_timeout(&self, flags: MessageFlags, timeout_ms: u64) -> Result<Message> {
        self.receive_inner(flags, Some(timeout_ms))
    }

    fn receive_inner(&self, flags: MessageFlags, timeout_ms: Option<u64>) -> Result<Message> {
        stats::operation(ObjectKind::MessageQueue);

        if self.used_slots.try_wait().is_err() {
            if flags.contains(MessageFlags::NONBLOCK) {
                return Err(IpcError::QueueEmpty);
            }
            self.counters.blocked_receives.fetch_add(1, Ordering::Relaxed);
            let waited = match timeout_ms {
                Some(ms) => self.used_slots.wait_timeout(ms),
                None => self.used_slots.wait(),
            };
            match waited {
                Ok(()) => {}
                Err(IpcError::Timeout) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(IpcError::Timeout);
                }
                Err(IpcError::InvalidHandle) => return Err(IpcError::QueueDestroyed),
                Err(e) => return Err(e),
            }
        }

        let msg = {
            let mut st = self.state.lock();
            if st.destroyed {
                return Err(IpcError::QueueDestroyed);
            }
            let Some(msg) = st.messages.pop_front() else {
                // Unreachable while the semaphores are in sync.
                let _ = self.used_slots.post();
                return Err(IpcError::QueueEmpty);
            };
            match msg.header.priority {
                MessagePriority::Urgent => st.urgent_count -= 1,
                MessagePriority::High => st.high_count -= 1,
                _ => {}
            }
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            msg
        };

        let _ = self.free_slots.post();
        Ok(msg)
    }

    /// Pull the response to `original_id` out of the queue, wherever it
    /// sits. Non-blocking; `QueueEmpty` when no matching response is queued.
    pub fn receive_reply(&self, original_id: u32) -> Result<Message> {
        stats::operation(ObjectKind::MessageQueue);
        if self.used_slots.try_wait().is_err() {
            return Err(IpcError::QueueEmpty);
        }
        let found = {
            let mut st = self.state.lock();
            let pos = st.messages.iter().position(|m| {
                m.header.kind == MessageKind::Response && m.header.reply_id == original_id
            });
            match pos.and_then(|p| st.messages.remove(p)) {
                Some(msg) => {
                    match msg.header.priority {
                        MessagePriority::Urgent => st.urgent_count -= 1,
                        MessagePriority::High => st.high_count -= 1,
                        _ => {}
                    }
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    Some(msg)
                }
                None => None,
            }
        };
        match found {
            Some(msg) => {
                let _ = self.free_slots.post();
                Ok(msg)
            }
            None => {
                let _ = self.used_slots.post();
                Err(IpcError::QueueEmpty)
            }
        }
    }

    /// Per-queue statistics snapshot.
    pub fn stats(&self) -> QueueStats {
        let st = self.state.lock();
        QueueStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            blocked_sends: self.counters.blocked_sends.load(Ordering::Relaxed),
            blocked_receives: self.counters.blocked_receives.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            current_size: st.messages.len(),
            high_count: st.high_count,
            urgent_count: st.urgent_count,
        }
    }
}

/// Set up a reply to `original` and send it through the target task's
/// default send queue. Returns `NoRoute` when the original sender has no
/// routable queue.
pub fn reply_to_message(original: &Message, mut reply: Message, flags: MessageFlags) -> Result<u32> {
    reply.header.receiver = original.header.sender;
    reply.header.kind = MessageKind::Response;
    reply.header.priority = MessagePriority::High;
    reply.header.reply_id = original.header.id;

    let target = queue_registry::find_task_queue(original.header.sender, QueueLookup::Send)
        .ok_or(IpcError::NoRoute)?;
    let id = target.send(reply, flags)?;
    Ok(id)
}

/// Destroy a message queue. Blocked senders and receivers are woken and
/// observe `QueueDestroyed`; only the creator or the kernel may destroy it.
pub fn destroy_message_queue(queue: &Arc<MessageQueue>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != queue.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    match queue.header.release_owner_hold() {
        Some(0) => {
            destroy_message_queue_internal(queue);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped.
pub(crate) fn destroy_for_exit(queue: &Arc<MessageQueue>) {
    destroy_message_queue_internal(queue);
}

fn destroy_message_queue_internal(queue: &Arc<MessageQueue>) {
    queue.state.lock().destroyed = true;
    queue.free_slots.wake_all(WaitStatus::Destroyed);
    queue.used_slots.wake_all(WaitStatus::Destroyed);
    queue_registry::purge_queue(queue);
    QUEUES.lock().retain(|q| !Arc::ptr_eq(q, queue));
    object::unregister(queue.header.id());
    stats::object_destroyed(ObjectKind::MessageQueue);
    log::info!("destroyed message queue \"{}\"", queue.header.name());
}

/// Task-exit hook: drop every message sent by or addressed to the exiting
/// task from every queue, then resync the slot semaphores to the surviving
/// message count.
pub fn cleanup_task_messages(pid: Pid) {
    let pool: Vec<Arc<MessageQueue>> = QUEUES.lock().clone();
    for queue in pool {
        queue.free_slots.purge_waiter(pid);
        queue.used_slots.purge_waiter(pid);

        let (removed, current, capacity) = {
            let mut st = queue.state.lock();
            let before = st.messages.len();
            st.messages
                .retain(|m| m.header.sender != pid && m.header.receiver != pid);
            st.high_count = st
                .messages
                .iter()
                .filter(|m| m.header.priority == MessagePriority::High)
                .count() as u32;
            st.urgent_count = st
                .messages
                .iter()
                .filter(|m| m.header.priority == MessagePriority::Urgent)
                .count() as u32;
            (before - st.messages.len(), st.messages.len(), st.capacity)
        };

        if removed > 0 {
            queue.used_slots.reinit(current as i32, capacity as i32);
            queue
                .free_slots
                .reinit((capacity - current) as i32, capacity as i32);
            log::info!(
                "removed {} messages of terminated task {} from queue \"{}\"",
                removed,
                pid,
                queue.header.name()
            );
        }
    }
}

/// Periodic sweep: expire blocked senders/receivers whose deadlines are
/// due, and mark `SYNC` messages nobody answered within the stale window.
pub fn check_timeouts(now: u64) {
    let pool: Vec<Arc<MessageQueue>> = QUEUES.lock().clone();
    for queue in pool {
        queue.free_slots.sweep(now);
        queue.used_slots.sweep(now);

        let mut st = queue.state.lock();
        for msg in st.messages.iter_mut() {
            if msg.header.flags.contains(MessageFlags::SYNC)
                && !msg.header.flags.contains(MessageFlags::TIMED_OUT)
                && now.saturating_sub(msg.header.timestamp_ms) > SYNC_STALE_MS
            {
                msg.header.flags |= MessageFlags::TIMED_OUT;
                queue.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Log every live queue with its counters.
pub fn dump_all_message_queues() {
    let pool = QUEUES.lock();
    log::info!("===== Message Queue Dump ({} queues) =====", pool.len());
    for q in pool.iter() {
        let s = q.stats();
        log::info!(
            "queue \"{}\": {}/{} messages ({} high, {} urgent)",
            q.header.name(),
            s.current_size,
            q.capacity(),
            s.high_count,
            s.urgent_count
        );
        log::info!(
            "  sent={} received={} blocked={}S/{}R dropped={} timeouts={}",
            s.sent,
            s.received,
            s.blocked_sends,
            s.blocked_receives,
            s.dropped,
            s.timeouts
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::teststub;

    fn msg(priority: MessagePriority, payload: &[u8]) -> Message {
        Message::new(0, MessageKind::Normal, priority, payload).unwrap()
    }

    #[test]
    fn wire_layout_offsets() {
        teststub::install_stub();
        let mut m = msg(MessagePriority::High, b"abc");
        m.header.id = 0x01020304;
        m.header.sender = 7;
        m.header.receiver = 9;
        m.header.flags = MessageFlags::SYNC;
        m.header.reply_id = 0x0A0B0C0D;
        m.header.timestamp_ms = 0x1122334455667788;

        let wire = m.encode();
        assert_eq!(wire.len(), WIRE_HEADER_LEN + 3);
        assert_eq!(&wire[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&wire[4..8], &7u32.to_le_bytes());
        assert_eq!(&wire[8..12], &9u32.to_le_bytes());
        assert_eq!(&wire[12..16], &0u32.to_le_bytes()); // kind Normal
        assert_eq!(&wire[16..20], &2u32.to_le_bytes()); // priority High
        assert_eq!(&wire[20..24], &MessageFlags::SYNC.bits().to_le_bytes());
        assert_eq!(&wire[24..28], &3u32.to_le_bytes());
        assert_eq!(&wire[28..32], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&wire[32..40], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&wire[40..], b"abc");
    }

    #[test]
    fn decode_inverts_encode() {
        teststub::install_stub();
        let mut m = msg(MessagePriority::Urgent, b"payload bytes");
        m.header.id = 42;
        m.header.receiver = 3;
        let back = Message::decode(&m.encode()).unwrap();
        assert_eq!(back.header.id, 42);
        assert_eq!(back.header.priority, MessagePriority::Urgent);
        assert_eq!(back.payload(), b"payload bytes");
    }

    #[test]
    fn decode_rejects_garbage() {
        teststub::install_stub();
        assert!(Message::decode(&[0u8; 10]).is_err());
        let mut wire = msg(MessagePriority::Low, b"x").encode();
        wire[16] = 99; // invalid priority
        assert!(Message::decode(&wire).is_err());
    }

    #[test]
    fn oversized_payload_is_refused() {
        teststub::install_stub();
        let big = [0u8; MAX_MESSAGE_SIZE + 1];
        assert!(Message::new(0, MessageKind::Normal, MessagePriority::Low, &big).is_err());
    }

    #[test]
    fn nonblocking_full_and_empty() {
        teststub::install_stub();
        teststub::set_current_pid(80);
        let q = create_message_queue("t_full_empty", 2).unwrap();
        q.send(msg(MessagePriority::Normal, b"a"), MessageFlags::NONBLOCK).unwrap();
        q.send(msg(MessagePriority::Normal, b"b"), MessageFlags::NONBLOCK).unwrap();
        assert_eq!(
            q.send(msg(MessagePriority::Normal, b"c"), MessageFlags::NONBLOCK).err(),
            Some(IpcError::QueueFull)
        );
        q.receive(MessageFlags::NONBLOCK).unwrap();
        q.receive(MessageFlags::NONBLOCK).unwrap();
        assert_eq!(
            q.receive(MessageFlags::NONBLOCK).err(),
            Some(IpcError::QueueEmpty)
        );
        assert_eq!(q.stats().dropped, 1);
        destroy_message_queue(&q).unwrap();
    }

    #[test]
    fn delivery_is_priority_then_fifo_with_urgent_head() {
        teststub::install_stub();
        teststub::set_current_pid(81);
        let q = create_message_queue("t_priority", 10).unwrap();
        q.send(msg(MessagePriority::Low, b"low-1"), MessageFlags::NONBLOCK).unwrap();
        q.send(
            msg(MessagePriority::Urgent, b"urgent"),
            MessageFlags::NONBLOCK | MessageFlags::URGENT,
        )
        .unwrap();
        q.send(msg(MessagePriority::Normal, b"normal"), MessageFlags::NONBLOCK).unwrap();
        q.send(msg(MessagePriority::High, b"high"), MessageFlags::NONBLOCK).unwrap();
        q.send(msg(MessagePriority::Low, b"low-2"), MessageFlags::NONBLOCK).unwrap();

        let order: Vec<_> = (0..5)
            .map(|_| q.receive(MessageFlags::NONBLOCK).unwrap())
            .collect();
        let payloads: Vec<&[u8]> = order.iter().map(|m| m.payload()).collect();
        assert_eq!(
            payloads,
            [
                b"urgent".as_slice(),
                b"high".as_slice(),
                b"normal".as_slice(),
                b"low-1".as_slice(),
                b"low-2".as_slice(),
            ]
        );
        destroy_message_queue(&q).unwrap();
    }

    #[test]
    fn slot_semaphores_mirror_queue_size() {
        teststub::install_stub();
        teststub::set_current_pid(82);
        let q = create_message_queue("t_slots", 4).unwrap();
        q.send(msg(MessagePriority::Normal, b"a"), MessageFlags::NONBLOCK).unwrap();
        q.send(msg(MessagePriority::Normal, b"b"), MessageFlags::NONBLOCK).unwrap();
        assert_eq!(q.slot_values(), (2, 2));
        q.receive(MessageFlags::NONBLOCK).unwrap();
        assert_eq!(q.slot_values(), (1, 3));
        destroy_message_queue(&q).unwrap();
    }

    #[test]
    fn task_death_purges_messages_and_resyncs_slots() {
        teststub::install_stub();
        let q = create_message_queue("t_death", 8).unwrap();
        for pid in 100..105u32 {
            teststub::set_current_pid(pid);
            q.send(msg(MessagePriority::Normal, b"seed"), MessageFlags::NONBLOCK).unwrap();
        }
        cleanup_task_messages(102);
        assert_eq!(q.len(), 4);
        assert_eq!(q.slot_values(), (4, 4));
        while let Ok(m) = q.receive(MessageFlags::NONBLOCK) {
            assert_ne!(m.header.sender, 102);
        }
        teststub::set_current_pid(crate::sched::PID_KERNEL);
        destroy_message_queue(&q).unwrap();
    }

    #[test]
    fn receive_reply_matches_reply_id() {
        teststub::install_stub();
        teststub::set_current_pid(83);
        let q = create_message_queue("t_reply_scan", 4).unwrap();
        q.send(msg(MessagePriority::Normal, b"noise"), MessageFlags::NONBLOCK).unwrap();
        let mut resp = msg(MessagePriority::High, b"answer");
        resp.header.kind = MessageKind::Response;
        let sent_id = q.send(resp, MessageFlags::NONBLOCK).unwrap();
        // The reply correlates through reply_id, patched post-send here.
        {
            let mut st = q.state.lock();
            for m in st.messages.iter_mut() {
                if m.header.id == sent_id {
                    m.header.reply_id = 777;
                }
            }
        }
        let got = q.receive_reply(777).unwrap();
        assert_eq!(got.payload(), b"answer");
        assert_eq!(q.len(), 1);
        destroy_message_queue(&q).unwrap();
    }
}
