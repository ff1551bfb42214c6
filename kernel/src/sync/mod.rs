//! Synchronization bootstrap for the kernel.
//!
//! Provides the raw [`spinlock::Spinlock`] that every IPC object builds on.
//! The sleeping primitives (mutex, semaphore, events) live in [`crate::ipc`].

pub mod spinlock;

pub use spinlock::{Spinlock, SpinlockGuard};
