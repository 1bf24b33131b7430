//! Process management (§3 "Process control block (PCB)", §4.H fork/exit/wait).
//!
//! Scheduling itself (ready/sleep queues, dispatch, context switch) lives in
//! [`crate::sched`]; this module owns everything that also touches the
//! address space and the process table: the PCB, fork, exit and waitpid.

extern crate alloc;

use alloc::boxed::Box;

pub mod exit;
pub mod fork;
pub mod pcb;
pub mod table;
pub mod wait;

pub use exit::exit;
pub use fork::fork;
pub use pcb::Pcb;
pub use wait::waitpid;

use crate::error::KernelResult;
use crate::mm::vas;
use crate::sched::{self, ProcessId, ThreadId};

/// Software cap on live pids; i386 has no PCID so this is bookkeeping only
/// (§9 open question).
pub const MAX_PROCESS: usize = 4096;

/// Every thread's kernel stack, fixed size per §6 "Numeric constants".
pub const THREAD_KERNEL_STACK_SIZE: usize = 0x1000;
/// Largest a single thread's *user* stack may grow to (stack-grow fault
/// handling in [`crate::mm::page_fault`] enforces this ceiling).
pub const MAX_THREAD_STACK_SIZE: usize = 0x40_0000;

/// Heap-backs a fresh kernel stack and returns `(base, top)`. Kernel stacks
/// are small (one page) and short-lived relative to the kernel heap's
/// lifetime, so leaking the allocation for the thread's lifetime (freed only
/// when the owning process is reaped, via [`free_kernel_stack`]) is simpler
/// than threading a custom allocator through the scheduler.
pub(crate) fn alloc_kernel_stack(size: usize) -> (usize, usize) {
    let storage = Box::leak(alloc::vec![0u8; size].into_boxed_slice());
    let base = storage.as_mut_ptr() as usize;
    (base, base + size)
}

/// Reclaims a kernel stack handed out by [`alloc_kernel_stack`].
///
/// # Safety
/// `base` must be a pointer previously returned by `alloc_kernel_stack` with
/// the same `size`, and the owning thread must no longer be running on it.
pub(crate) unsafe fn free_kernel_stack(base: usize, size: usize) {
    // SAFETY: forwarded from the caller's contract.
    unsafe {
        let _ = Box::from_raw(core::ptr::slice_from_raw_parts_mut(base as *mut u8, size));
    }
}

/// Brings up process management: the process table, then pid 0 ("init").
pub fn init() -> KernelResult<()> {
    table::init();
    vas::init();

    let pid = ProcessId(0);
    let space = vas::create(pid)?;
    let (base, top) = alloc_kernel_stack(THREAD_KERNEL_STACK_SIZE);
    let thread = sched::create_kernel_thread(pid, sched::IDLE_PRIORITY - 1, init_entry, top, THREAD_KERNEL_STACK_SIZE);
    let _ = base;

    let mut pcb = Pcb::new(pid, None, space);
    pcb.add_thread(thread.tid);
    table::insert(pcb);

    kprintln!("[PROCESS] process management initialized, init pid=0 tid={}", thread.tid.0);
    Ok(())
}

extern "C" fn init_entry() -> ! {
    loop {
        sched::yield_cpu();
    }
}

/// The PCB of the currently running thread's process, if any.
pub fn current_pcb() -> Option<alloc::sync::Arc<spin::Mutex<Pcb>>> {
    table::get(sched::current()?.pid)
}

pub fn current_pid() -> Option<ProcessId> {
    sched::current().map(|t| t.pid)
}

pub fn current_tid() -> Option<ThreadId> {
    sched::current_tid()
}
