//! Obsidian kernel library
//!
//! Core of a 32-bit protected-mode x86 kernel: physical frame allocation,
//! two-level paging, interrupt dispatch, and a multilevel-feedback-queue
//! task manager. The library exports everything needed by the boot binary
//! and by the host-side unit test suite.

#![no_std]

extern crate alloc;

// On bare metal the kernel bootstrap heap backs the Rust allocator.
// On host targets (used for unit tests) we delegate to the system allocator
// so that test code using Vec/String/BTreeMap compiles and runs under the
// standard harness.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global bootstrap allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod interrupts;
pub mod log_service;
pub mod mm;
pub mod sync;
pub mod task;
pub mod terminal;
pub mod timer;

pub use error::KernelError;
pub use mm::{PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};
pub use task::{Pid, TaskState};
