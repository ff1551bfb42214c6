//! EdgeX kernel: IPC subsystem core.
//!
//! A small x86-64 microkernel's inter-process communication layer: mutexes,
//! semaphores, events and event sets, priority message queues, and
//! shared-memory segments over a common object/registry/wait-queue
//! substrate.
//!
//! Boot, console, the scheduler, and the page-directory manager live
//! outside this crate and are reached through the collaborator interfaces
//! in [`sched`] and [`memory::ops`]. Install both backends, call
//! [`ipc::init`], and the subsystem wires its periodic timeout sweep and
//! task-exit cleanup into the scheduler's hooks.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ipc;
pub mod memory;
pub mod sched;
pub mod sync;
