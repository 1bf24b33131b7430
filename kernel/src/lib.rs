//! Kernel library: exposes every subsystem for the host test harness and
//! for `main.rs`'s bare-metal entry point.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[macro_use]
pub mod print;

mod intrinsics;

pub mod arch;
pub mod bootstrap;
pub mod error;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod timer;

// Bare-metal target: the kernel heap is the one and only allocator (see
// `mm::heap`, which self-registers as `#[global_allocator]`). Host tests use
// the system allocator instead so `Vec`/`BTreeMap`/etc. work without a real
// no_std arena.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Heap allocation error handler. Panic is intentional: heap exhaustion in
/// a no_std kernel is unrecoverable. The alloc_error_handler ABI requires
/// `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
