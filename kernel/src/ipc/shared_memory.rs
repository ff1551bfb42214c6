//! Shared-memory segments for zero-copy IPC between tasks.
//!
//! A segment is a named set of physical frames that can be mapped into
//! multiple task address spaces. The protocol reference count equals the
//! creator's hold plus one per live mapping; when it drains to zero the
//! frames are freed unless the segment was created `PERSIST`. Each
//! mapping's effective permissions are the intersection of what the mapper
//! requested with the segment's defaults.
//!
//! Virtual addresses for mappings come from a reserved region starting at
//! [`SHM_REGION_BASE`], bumped per mapping.
//!
//! With the `COW` flag, pages are mapped write-protected; the
//! page-directory fault handler calls [`handle_cow_fault`] on the first
//! write, which gives the faulting task a private copy of the page. The
//! segment's own page vector never changes on a COW break.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::memory::address::{align_up, PhysAddr, VirtAddr};
use crate::memory::ops::{self as mem, AllocFlags, PageFlags};
use crate::memory::FRAME_SIZE;
use crate::ipc::object::{self, ObjectHeader, ObjectKind, ObjectName, ObjectRef};
use crate::ipc::{stats, IpcError, Result};
use crate::sched::{self, Pid, PID_KERNEL};
use crate::sync::Spinlock;

/// Base virtual address of the reserved shared-memory mapping region.
pub const SHM_REGION_BASE: u64 = 0x7F00_0000_0000;

/// System-wide cap on live segments.
pub const MAX_SHM_SEGMENTS: usize = 128;

/// Maximum per-task mappings of one segment.
pub const MAX_SHM_MAPPINGS: usize = 32;

bitflags! {
    /// Segment access permissions.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ShmPerms: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl ShmPerms {
    pub const RW: ShmPerms = ShmPerms::READ.union(ShmPerms::WRITE);
    pub const RX: ShmPerms = ShmPerms::READ.union(ShmPerms::EXEC);
    pub const RWX: ShmPerms = ShmPerms::RW.union(ShmPerms::EXEC);
}

bitflags! {
    /// Segment creation flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ShmFlags: u32 {
        /// Create the segment if it does not exist.
        const CREATE  = 1 << 0;
        /// Fail with `NameCollision` if the segment already exists.
        const EXCL    = 1 << 1;
        /// Allow the segment to be resized after creation.
        const RESIZE  = 1 << 2;
        /// Map write-protected and break shares on first write.
        const COW     = 1 << 3;
        /// Keep the segment (and its pages) when the refcount drains.
        const PERSIST = 1 << 4;
        /// Lock the frames in physical memory (no swapping).
        const LOCKED  = 1 << 5;
    }
}

/// One task's view of a segment.
struct ShmMapping {
    pid: Pid,
    vaddr: VirtAddr,
    /// Logical size at map time; tracks the segment across resizes.
    size: usize,
    /// Effective permissions (requested ∩ default).
    perms: ShmPerms,
}

struct ShmState {
    /// Logical size requested by the creator.
    size: usize,
    /// Page-aligned allocated size.
    real_size: usize,
    /// Backing frames in page order.
    frames: Vec<PhysAddr>,
    /// Default permissions new mappings intersect with.
    perms: ShmPerms,
    flags: ShmFlags,
    mappings: Vec<ShmMapping>,
    created_at_ms: u64,
}

/// A reference-counted shared-memory segment.
pub struct ShmSegment {
    header: ObjectHeader,
    state: Spinlock<ShmState>,
}

/// Point-in-time description of a segment.
#[derive(Clone, Copy, Debug)]
pub struct ShmInfo {
    pub name: ObjectName,
    pub size: usize,
    pub real_size: usize,
    pub perms: ShmPerms,
    pub flags: ShmFlags,
    pub ref_count: u32,
    pub creator: Pid,
    pub mapping_count: usize,
    pub created_at_ms: u64,
}

static SEGMENTS: Spinlock<Vec<Arc<ShmSegment>>> = Spinlock::new(Vec::new());
static NEXT_SHM_VADDR: Spinlock<u64> = Spinlock::new(SHM_REGION_BASE);

fn alloc_virt(real_size: usize) -> VirtAddr {
    let mut next = NEXT_SHM_VADDR.lock();
    let addr = *next;
    *next += real_size as u64;
    VirtAddr::new(addr)
}

fn page_flags_for(perms: ShmPerms, cow: bool) -> PageFlags {
    let mut flags = PageFlags::SHARED;
    if perms.contains(ShmPerms::READ) {
        flags |= PageFlags::READ;
    }
    if perms.contains(ShmPerms::WRITE) {
        // COW mappings stay write-protected so the first write faults.
        if cow {
            flags |= PageFlags::COW;
        } else {
            flags |= PageFlags::WRITE;
        }
    }
    if perms.contains(ShmPerms::EXEC) {
        flags |= PageFlags::EXEC;
    }
    flags
}

/// Create a shared-memory segment, or open an existing one by name.
///
/// Opening an existing segment bumps its refcount, updates the default
/// permissions when `perms` is non-empty, and grows a too-small segment if
/// it was created `RESIZE` (failing with
/// `NoResize` otherwise). `EXCL` turns an existing name into a
/// `NameCollision` error.
pub fn create_shared_memory(
    name: &str,
    size: usize,
    perms: ShmPerms,
    flags: ShmFlags,
) -> Result<Arc<ShmSegment>> {
    if size == 0 {
        return Err(IpcError::InvalidArgument);
    }

    if let Some(segment) = find_shared_memory(name) {
        if flags.contains(ShmFlags::EXCL) {
            log::error!("shared memory segment \"{name}\" already exists");
            return Err(IpcError::NameCollision);
        }
        {
            let st = segment.state.lock();
            if st.size < size && !st.flags.contains(ShmFlags::RESIZE) {
                return Err(IpcError::NoResize);
            }
        }
        if segment.state.lock().size < size {
            segment.resize(size)?;
        }
        if !perms.is_empty() {
            segment.state.lock().perms = perms;
        }
        segment.header.retain();
        return Ok(segment);
    }

    if !flags.contains(ShmFlags::CREATE) {
        return Err(IpcError::InvalidArgument);
    }
    if SEGMENTS.lock().len() >= MAX_SHM_SEGMENTS {
        stats::allocation_failure();
        return Err(IpcError::OutOfMemory);
    }

    let real_size = align_up(size);
    let frames = mem::alloc_pages(real_size / FRAME_SIZE, AllocFlags::ZERO | AllocFlags::KERNEL)
        .ok_or_else(|| {
            stats::allocation_failure();
            log::error!("failed to allocate {real_size} bytes for shared segment \"{name}\"");
            IpcError::OutOfMemory
        })?;

    let header = ObjectHeader::new(ObjectKind::SharedMemory, name, sched::current_pid())?;
    let segment = Arc::new(ShmSegment {
        header,
        state: Spinlock::new(ShmState {
            size,
            real_size,
            frames,
            perms,
            flags,
            mappings: Vec::new(),
            created_at_ms: sched::now_ticks(),
        }),
    });

    SEGMENTS.lock().push(segment.clone());
    if let Err(e) = object::register(ObjectRef::SharedMemory(segment.clone())) {
        let frames = core::mem::take(&mut segment.state.lock().frames);
        mem::free_pages(&frames);
        SEGMENTS.lock().retain(|s| !Arc::ptr_eq(s, &segment));
        return Err(e);
    }
    log::info!(
        "created shared memory segment \"{}\" ({} bytes, {} pages)",
        segment.header.name(),
        size,
        real_size / FRAME_SIZE
    );
    Ok(segment)
}

/// Find a live segment by name.
pub fn find_shared_memory(name: &str) -> Option<Arc<ShmSegment>> {
    SEGMENTS
        .lock()
        .iter()
        .find(|s| s.header.name().as_str() == name)
        .cloned()
}

impl ShmSegment {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Map the segment into the calling task's address space.
    ///
    /// Mapping twice from one task returns the existing address. The
    /// mapping's effective permissions are `requested ∩ default`; an empty
    /// intersection is refused.
    pub fn map(&self, requested: ShmPerms) -> Result<VirtAddr> {
        stats::operation(ObjectKind::SharedMemory);
        let pid = sched::current_pid();
        let mut st = self.state.lock();

        if let Some(m) = st.mappings.iter().find(|m| m.pid == pid) {
            log::warn!(
                "task {} already has segment \"{}\" mapped at {:#x}",
                pid,
                self.header.name(),
                m.vaddr.as_u64()
            );
            return Ok(m.vaddr);
        }

        let effective = requested & st.perms;
        if effective.is_empty() {
            stats::permission_failure();
            return Err(IpcError::PermissionDenied);
        }
        if st.mappings.len() >= MAX_SHM_MAPPINGS {
            stats::allocation_failure();
            return Err(IpcError::OutOfMemory);
        }

        let vaddr = alloc_virt(st.real_size);
        let cow = st.flags.contains(ShmFlags::COW);
        mem::map_pages(vaddr, &st.frames, st.real_size, page_flags_for(effective, cow)).map_err(
            |e| {
                log::error!("failed to map segment \"{}\": {e}", self.header.name());
                IpcError::OutOfMemory
            },
        )?;
        mem::flush_tlb(vaddr, st.real_size);

        let size = st.size;
        st.mappings.push(ShmMapping {
            pid,
            vaddr,
            size,
            perms: effective,
        });
        self.header.retain();
        log::info!(
            "mapped segment \"{}\" for task {} at {:#x} (perms {:?})",
            self.header.name(),
            pid,
            vaddr.as_u64(),
            effective
        );
        Ok(vaddr)
    }

    /// Resize the segment. Only permitted when it was created `RESIZE`.
    ///
    /// Growing zero-fills the new tail and remaps every holder over the
    /// extended page vector; shrinking unmaps the tail from every holder
    /// before the released frames are freed.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        stats::operation(ObjectKind::SharedMemory);
        if new_size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        let mut st = self.state.lock();
        if !st.flags.contains(ShmFlags::RESIZE) {
            log::error!("resize not allowed for segment \"{}\"", self.header.name());
            return Err(IpcError::NoResize);
        }

        let new_real = align_up(new_size);
        if new_real == st.real_size {
            st.size = new_size;
            for m in st.mappings.iter_mut() {
                m.size = new_size;
            }
            return Ok(());
        }

        let cow = st.flags.contains(ShmFlags::COW);
        if new_real > st.real_size {
            let extra = (new_real - st.real_size) / FRAME_SIZE;
            let new_frames = mem::alloc_pages(extra, AllocFlags::ZERO | AllocFlags::KERNEL)
                .ok_or_else(|| {
                    stats::allocation_failure();
                    IpcError::OutOfMemory
                })?;
            st.frames.extend(new_frames);

            let old_real = st.real_size;
            let frames = core::mem::take(&mut st.frames);
            for m in st.mappings.iter_mut() {
                if let Err(e) = mem::unmap_pages(m.vaddr, old_real) {
                    log::error!("resize: unmap for task {} failed: {e}", m.pid);
                }
                if let Err(e) = mem::map_pages(m.vaddr, &frames, new_real, page_flags_for(m.perms, cow)) {
                    log::error!("resize: remap for task {} failed: {e}", m.pid);
                }
                mem::flush_tlb(m.vaddr, new_real);
                m.size = new_size;
            }
            st.frames = frames;
        } else {
            let released = st.frames.split_off(new_real / FRAME_SIZE);
            let tail_len = st.real_size - new_real;
            for m in st.mappings.iter_mut() {
                let tail = m.vaddr.offset(new_real);
                if let Err(e) = mem::unmap_pages(tail, tail_len) {
                    log::error!("resize: tail unmap for task {} failed: {e}", m.pid);
                }
                mem::flush_tlb(tail, tail_len);
                m.size = new_size;
            }
            mem::free_pages(&released);
        }

        log::info!(
            "resized segment \"{}\" from {} to {} bytes",
            self.header.name(),
            st.real_size,
            new_real
        );
        st.real_size = new_real;
        st.size = new_size;
        Ok(())
    }

    /// Describe the segment.
    pub fn info(&self) -> ShmInfo {
        let st = self.state.lock();
        ShmInfo {
            name: *self.header.name(),
            size: st.size,
            real_size: st.real_size,
            perms: st.perms,
            flags: st.flags,
            ref_count: self.header.ref_count(),
            creator: self.header.owner(),
            mapping_count: st.mappings.len(),
            created_at_ms: st.created_at_ms,
        }
    }

    /// Number of live mappings. Advisory.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }
}

/// Unmap the calling task's mapping at `addr`.
pub fn unmap_shared_memory(addr: VirtAddr, size: usize) -> Result<()> {
    stats::operation(ObjectKind::SharedMemory);
    if size == 0 {
        return Err(IpcError::InvalidArgument);
    }
    let pid = sched::current_pid();

    let pool: Vec<Arc<ShmSegment>> = SEGMENTS.lock().clone();
    for segment in pool {
        let unmapped = {
            let mut st = segment.state.lock();
            match st
                .mappings
                .iter()
                .position(|m| m.pid == pid && m.vaddr == addr)
            {
                Some(pos) => {
                    let real_size = st.real_size;
                    if let Err(e) = mem::unmap_pages(addr, real_size) {
                        log::error!("failed to unmap segment pages at {:#x}: {e}", addr.as_u64());
                        return Err(IpcError::InvalidAddress);
                    }
                    mem::flush_tlb(addr, real_size);
                    st.mappings.remove(pos);
                    true
                }
                None => false,
            }
        };
        if unmapped {
            log::info!(
                "unmapped segment \"{}\" for task {} from {:#x}",
                segment.header.name(),
                pid,
                addr.as_u64()
            );
            release_segment(&segment);
            return Ok(());
        }
    }
    log::error!(
        "no shared memory segment mapped at {:#x} for task {}",
        addr.as_u64(),
        pid
    );
    Err(IpcError::InvalidAddress)
}

/// Drop one protocol reference, destroying the segment when none remain
/// (unless it was created `PERSIST`).
fn release_segment(segment: &Arc<ShmSegment>) {
    if segment.header.release() == 0 && !segment.state.lock().flags.contains(ShmFlags::PERSIST) {
        destroy_segment_internal(segment);
    }
}

/// Destroy a segment (drop the creator's hold). Only the creator or the
/// kernel may do this; holders keep the segment alive until they unmap.
pub fn destroy_shared_memory(segment: &Arc<ShmSegment>) -> Result<()> {
    let caller = sched::current_pid();
    if caller != segment.header.owner() && caller != PID_KERNEL {
        stats::permission_failure();
        return Err(IpcError::PermissionDenied);
    }
    match segment.header.release_owner_hold() {
        Some(0) => {
            if !segment.state.lock().flags.contains(ShmFlags::PERSIST) {
                destroy_segment_internal(segment);
            }
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(IpcError::InvalidHandle),
    }
}

/// Exit-path destruction, after the creator hold has been dropped.
/// Persistent segments survive their creator.
pub(crate) fn destroy_for_exit(segment: &Arc<ShmSegment>) {
    if !segment.state.lock().flags.contains(ShmFlags::PERSIST) {
        destroy_segment_internal(segment);
    }
}

fn destroy_segment_internal(segment: &Arc<ShmSegment>) {
    let frames = {
        let mut st = segment.state.lock();
        core::mem::take(&mut st.frames)
    };
    mem::free_pages(&frames);
    SEGMENTS.lock().retain(|s| !Arc::ptr_eq(s, segment));
    object::unregister(segment.header.id());
    stats::object_destroyed(ObjectKind::SharedMemory);
    log::info!("destroyed shared memory segment \"{}\"", segment.header.name());
}

/// Task-exit hook: unmap every mapping the exiting task holds, releasing
/// its references.
pub fn cleanup_task_shared_memory(pid: Pid) {
    let pool: Vec<Arc<ShmSegment>> = SEGMENTS.lock().clone();
    for segment in pool {
        let had_mapping = {
            let mut st = segment.state.lock();
            match st.mappings.iter().position(|m| m.pid == pid) {
                Some(pos) => {
                    let m = st.mappings.remove(pos);
                    let real_size = st.real_size;
                    if let Err(e) = mem::unmap_pages(m.vaddr, real_size) {
                        log::error!("exit cleanup: unmap for task {pid} failed: {e}");
                    }
                    mem::flush_tlb(m.vaddr, real_size);
                    true
                }
                None => false,
            }
        };
        if had_mapping {
            log::info!(
                "removed shared memory mapping of task {} in segment \"{}\"",
                pid,
                segment.header.name()
            );
            release_segment(&segment);
        }
    }
}

/// Resolve a COW write fault at `fault_addr` for `pid`.
///
/// Allocates a private frame, copies the shared page, and remaps just that
/// page writable with the COW flag cleared. The segment's page vector is
/// untouched; only the faulting task's view diverges.
pub fn handle_cow_fault(pid: Pid, fault_addr: VirtAddr) -> Result<()> {
    let pool: Vec<Arc<ShmSegment>> = SEGMENTS.lock().clone();
    for segment in pool {
        let st = segment.state.lock();
        let Some(m) = st.mappings.iter().find(|m| {
            m.pid == pid
                && fault_addr.as_u64() >= m.vaddr.as_u64()
                && fault_addr.as_u64() < m.vaddr.as_u64() + st.real_size as u64
        }) else {
            continue;
        };
        if !st.flags.contains(ShmFlags::COW) {
            return Err(IpcError::InvalidAddress);
        }
        if !m.perms.contains(ShmPerms::WRITE) {
            stats::permission_failure();
            return Err(IpcError::PermissionDenied);
        }

        let page_index = (fault_addr.as_u64() - m.vaddr.as_u64()) as usize / FRAME_SIZE;
        let page_base = m.vaddr.offset(page_index * FRAME_SIZE);
        let shared_frame = st.frames[page_index];

        let private = mem::alloc_pages(1, AllocFlags::KERNEL).ok_or_else(|| {
            stats::allocation_failure();
            IpcError::OutOfMemory
        })?;
        mem::copy_page(private[0], shared_frame);

        let mut flags = PageFlags::READ | PageFlags::WRITE;
        if m.perms.contains(ShmPerms::EXEC) {
            flags |= PageFlags::EXEC;
        }
        mem::map_pages(page_base, &private, FRAME_SIZE, flags).map_err(|e| {
            log::error!("COW break remap failed: {e}");
            mem::free_pages(&private);
            IpcError::OutOfMemory
        })?;
        mem::flush_tlb(page_base, FRAME_SIZE);
        stats::cow_break();
        log::debug!(
            "COW break: task {} page {} of segment \"{}\"",
            pid,
            page_index,
            segment.header.name()
        );
        return Ok(());
    }
    Err(IpcError::InvalidAddress)
}

/// Log every live segment.
pub fn dump_all_shared_memory() {
    let pool = SEGMENTS.lock();
    for seg in pool.iter() {
        let info = seg.info();
        log::info!(
            "shm \"{}\": {}/{} bytes, refs {}, {} mappings, perms {:?}, flags {:?}",
            info.name,
            info.size,
            info.real_size,
            info.ref_count,
            info.mapping_count,
            info.perms,
            info.flags
        );
    }
}
