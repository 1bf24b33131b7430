//! Page fault dispatch (component D, §4.D steps 1-4).
//!
//! Order of checks on every fault: is this address inside a registered
//! copy-on-write mapping that the fault can resolve on its own, is there a
//! registered fault-range handler for it, and if neither applies, escalate
//! — panic for a kernel-mode fault, terminate the thread for a user-mode
//! one.

use super::page_table::{self, EntryFlags};
use super::{frame_allocator, vas, PhysAddr, VirtAddr};
use crate::arch::x86::cpu;
use crate::sched::{self, TerminationCause};

/// What caused a fault, decoded from the faulting instruction's error code
/// (bit 0: present, bit 1: write, bit 2: user).
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub addr: VirtAddr,
    pub present: bool,
    pub write: bool,
    pub user: bool,
}

impl FaultInfo {
    pub fn from_error_code(error_code: u32) -> Self {
        Self {
            addr: VirtAddr::new(cpu::read_cr2()),
            present: error_code & 0x1 != 0,
            write: error_code & 0x2 != 0,
            user: error_code & 0x4 != 0,
        }
    }
}

/// Outcome of dispatching a fault, for the trap handler to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Resolved in-kernel (COW copy or handler ran); resume the faulting
    /// instruction.
    Resolved,
    /// No handler applies and the fault was in user mode: the faulting
    /// thread has been terminated, so the trap handler should reschedule
    /// rather than resume it.
    ThreadTerminated,
}

/// Attempts the copy-on-write fast path: a present, write-faulted page
/// whose frame is still shared (refcount > 1) gets a private copy; one
/// whose refcount has already dropped to 1 (every other sharer already
/// copied-and-dropped, or unmapped) just has its `WRITABLE` bit restored.
fn try_cow(info: &FaultInfo) -> bool {
    if !(info.present && info.write) {
        return false;
    }
    let Some(phys) = page_table::translate(info.addr) else {
        return false;
    };
    match frame_allocator::frame_refcount(phys) {
        Some(count) if count > 1 => {
            let Ok(new_phys) = frame_allocator::alloc_frames(1) else {
                return false;
            };
            // SAFETY: both frames are page-sized, page-aligned, and not
            // concurrently accessed by this CPU during the copy.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys.as_u32() as *const u8,
                    new_phys.as_u32() as *mut u8,
                    super::PAGE_SIZE,
                );
            }
            if page_table::unmap(info.addr).is_err() {
                return false;
            }
            let frame = super::FrameNumber::from_addr(new_phys.as_u32());
            let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER;
            let mapped = page_table::map(info.addr, frame, flags, || {
                let p = frame_allocator::alloc_frames(1)?;
                Ok(super::FrameNumber::from_addr(p.as_u32()))
            });
            let _ = frame_allocator::frame_ref_dec(phys);
            mapped.is_ok()
        }
        Some(_) => page_table::set_writable(info.addr, true).is_ok(),
        None => false,
    }
}

/// Looks up a registered fault-range handler over `addr` in the faulting
/// thread's address space.
fn registered_handler(addr: VirtAddr) -> Option<super::FaultHandlerFn> {
    let tcb = sched::current()?;
    let space = vas::get(tcb.pid)?;
    let space = space.lock();
    space.fault_handler_for(addr)
}

/// Escalates an unresolved fault: panics for a kernel-mode fault, since
/// the kernel half has no recovery path; terminates the faulting thread
/// for a user-mode one (§4.D step 4).
fn escalate(info: &FaultInfo) -> FaultOutcome {
    if !info.user {
        panic!(
            "unhandled page fault in kernel mode at {:#x} (present={}, write={})",
            info.addr.as_u32(),
            info.present,
            info.write
        );
    }
    sched::exit_current(139, TerminationCause::Segfault)
}

/// Dispatches a page fault. Never returns if it escalates to a kernel
/// panic; returns `ThreadTerminated` if it terminated a user thread.
pub fn handle(info: FaultInfo) -> FaultOutcome {
    if try_cow(&info) {
        return FaultOutcome::Resolved;
    }

    if !info.present {
        if let Some(handler) = registered_handler(info.addr) {
            return match handler(info.addr) {
                Ok(()) => FaultOutcome::Resolved,
                Err(_) => escalate(&info),
            };
        }
    }

    escalate(&info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_decodes_present_write_user() {
        let info = FaultInfo::from_error_code(0b111);
        assert!(info.present);
        assert!(info.write);
        assert!(info.user);
    }

    #[test]
    fn error_code_decodes_not_present_kernel_read() {
        let info = FaultInfo::from_error_code(0b000);
        assert!(!info.present);
        assert!(!info.write);
        assert!(!info.user);
    }

    fn demand_page_handler(_addr: VirtAddr) -> crate::error::KernelResult<()> {
        Ok(())
    }

    extern "C" fn noop_thread() -> ! {
        loop {
            sched::yield_cpu();
        }
    }

    /// §4.D step 2: a not-present fault inside a registered range must run
    /// the handler, not just report `Resolved` with the page still absent.
    #[test]
    fn not_present_fault_in_registered_range_invokes_handler() {
        sched::init().unwrap();
        vas::init();

        let pid = crate::sched::ProcessId(7);
        let space = vas::create(pid).unwrap();
        let thread = sched::create_kernel_thread(pid, 10, noop_thread, 0x10000, crate::process::THREAD_KERNEL_STACK_SIZE);
        sched::schedule();
        assert_eq!(sched::current_tid(), Some(thread.tid));

        space
            .lock()
            .register_fault_handler(VirtAddr::new(0x2000), VirtAddr::new(0x3000), demand_page_handler)
            .unwrap();

        let info = FaultInfo {
            addr: VirtAddr::new(0x2500),
            present: false,
            write: false,
            user: true,
        };
        assert_eq!(handle(info), FaultOutcome::Resolved);
    }

    /// A not-present fault with no registered handler over it, in kernel
    /// mode, must not be silently reported `Resolved`; it escalates to a
    /// kernel panic (§4.D step 4).
    #[test]
    #[should_panic(expected = "unhandled page fault")]
    fn not_present_fault_outside_any_range_panics_in_kernel_mode() {
        sched::init().unwrap();
        vas::init();

        let pid = crate::sched::ProcessId(8);
        vas::create(pid).unwrap();
        let thread = sched::create_kernel_thread(pid, 10, noop_thread, 0x10000, crate::process::THREAD_KERNEL_STACK_SIZE);
        sched::schedule();
        assert_eq!(sched::current_tid(), Some(thread.tid));

        let info = FaultInfo {
            addr: VirtAddr::new(0x9000),
            present: false,
            write: false,
            user: false,
        };
        handle(info);
    }
}
