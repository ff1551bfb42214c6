//! Memory-facing types for the IPC core.
//!
//! Provides typed address wrappers and the collaborator interface through
//! which the shared-memory engine reaches the physical allocator and the
//! page-directory manager.

pub mod address;
pub mod ops;

/// Size of a single memory page/frame in bytes (4 KiB).
pub const FRAME_SIZE: usize = 4096;
