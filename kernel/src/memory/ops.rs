//! Physical-memory and page-table collaborator interface.
//!
//! The shared-memory engine is the only IPC client of physical pages and
//! page mappings. It consumes the narrow contract below; the page-directory
//! manager behind it (frame bitmap, page tables, TLB shootdown) stays
//! outside the IPC core. The backend is installed once at boot (or by the
//! test harness) via [`install`].

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::memory::address::{PhysAddr, VirtAddr};
use crate::sync::Spinlock;

bitflags! {
    /// Flags for [`alloc_pages`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AllocFlags: u32 {
        /// Zero-fill the allocated frames.
        const ZERO   = 1 << 0;
        /// Allocate from the kernel pool.
        const KERNEL = 1 << 1;
    }
}

bitflags! {
    /// Page protection and mapping-mode flags passed to [`map_pages`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: u64 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        /// Page belongs to a shared mapping (not private to one task).
        const SHARED = 1 << 3;
        /// Copy-on-write: mapped read-only; the first write faults and the
        /// fault resolver breaks the share with a private copy.
        const COW    = 1 << 4;
    }
}

/// The contract the shared-memory engine requires from the memory manager.
pub trait MemoryOps: Send + Sync {
    /// Allocate `n` physical frames. Returns `None` when exhausted.
    fn alloc_pages(&self, n: usize, flags: AllocFlags) -> Option<Vec<PhysAddr>>;

    /// Return frames to the allocator.
    fn free_pages(&self, frames: &[PhysAddr]);

    /// Map `frames` contiguously at `virt` in the current task's address
    /// space. `size` is the byte length of the range (frame-aligned).
    fn map_pages(
        &self,
        virt: VirtAddr,
        frames: &[PhysAddr],
        size: usize,
        flags: PageFlags,
    ) -> Result<(), &'static str>;

    /// Remove the mapping at `virt` from the current task's address space.
    fn unmap_pages(&self, virt: VirtAddr, size: usize) -> Result<(), &'static str>;

    /// Invalidate the TLB for the given virtual range.
    fn flush_tlb(&self, virt: VirtAddr, size: usize);

    /// Copy the contents of frame `src` into frame `dst` (COW break).
    fn copy_page(&self, dst: PhysAddr, src: PhysAddr);
}

static MEMORY: Spinlock<Option<&'static dyn MemoryOps>> = Spinlock::new(None);

/// Install the memory backend. Called once at boot, before `ipc::init`.
pub fn install(ops: &'static dyn MemoryOps) {
    *MEMORY.lock() = Some(ops);
}

/// Whether a memory backend has been installed.
pub fn installed() -> bool {
    MEMORY.lock().is_some()
}

#[inline]
fn backend() -> &'static dyn MemoryOps {
    // Copy the reference out so no spinlock is held across the call.
    MEMORY.lock().expect("memory collaborator not installed")
}

/// Allocate `n` physical frames.
pub fn alloc_pages(n: usize, flags: AllocFlags) -> Option<Vec<PhysAddr>> {
    backend().alloc_pages(n, flags)
}

/// Return frames to the allocator.
pub fn free_pages(frames: &[PhysAddr]) {
    backend().free_pages(frames);
}

/// Map frames into the current task's address space.
pub fn map_pages(
    virt: VirtAddr,
    frames: &[PhysAddr],
    size: usize,
    flags: PageFlags,
) -> Result<(), &'static str> {
    backend().map_pages(virt, frames, size, flags)
}

/// Unmap a range from the current task's address space.
pub fn unmap_pages(virt: VirtAddr, size: usize) -> Result<(), &'static str> {
    backend().unmap_pages(virt, size)
}

/// Invalidate the TLB for a virtual range.
pub fn flush_tlb(virt: VirtAddr, size: usize) {
    backend().flush_tlb(virt, size);
}

/// Copy one frame's contents into another.
pub fn copy_page(dst: PhysAddr, src: PhysAddr) {
    backend().copy_page(dst, src);
}
