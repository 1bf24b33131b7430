//! `fork()` (§4.H "Fork"): new PCB, copy-on-write address space, duplicate
//! thread.
//!
//! This core models kernel-mode threads only (no ring-3/ELF continuation is
//! in scope, per §1's "preemptive user-mode with full POSIX" non-goal), so
//! the child does not resume at the parent's program counter: it starts as
//! a fresh kernel thread at a caller-supplied entry point, sharing the
//! copy-on-write address space `copy_self_mapping` built for it. The
//! parent's call returns the child's pid, matching the external contract.

use crate::error::{KernelError, KernelResult, ResourceError, StateError};
use crate::mm::vas;
use crate::sched::{self, ProcessId};

use super::pcb::Pcb;
use super::{table, THREAD_KERNEL_STACK_SIZE};

/// Forks the calling process: duplicates its address space via
/// copy-on-write and starts `child_entry` as the lone thread of a new
/// child process. Returns the child's pid to the caller (the parent).
pub fn fork(child_entry: extern "C" fn() -> !, child_priority: u8) -> KernelResult<ProcessId> {
    let parent_tid = sched::current_tid()
        .ok_or(KernelError::State(StateError::NotInitialized { subsystem: "sched" }))?;
    let parent_thread = sched::lookup(parent_tid)
        .ok_or(KernelError::Resource(ResourceError::NoSuchId { id: parent_tid.0 }))?;
    let parent_pid = parent_thread.pid;
    let parent_pcb = table::get(parent_pid)
        .ok_or(KernelError::Resource(ResourceError::NoSuchId { id: parent_pid.0 }))?;

    let child_pid = table::alloc_pid()?;
    let child_space = vas::create(child_pid)?;
    vas::copy_self_mapping(&mut child_space.lock())?;

    let (_, stack_top) = super::alloc_kernel_stack(THREAD_KERNEL_STACK_SIZE);
    let child_thread =
        sched::create_kernel_thread(child_pid, child_priority, child_entry, stack_top, THREAD_KERNEL_STACK_SIZE);

    let mut child_pcb = Pcb::new(child_pid, Some(parent_pid), child_space);
    child_pcb.add_thread(child_thread.tid);
    table::insert(child_pcb);
    parent_pcb.lock().add_child(child_pid);

    Ok(child_pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn child_noop() -> ! {
        loop {
            sched::yield_cpu();
        }
    }

    #[test]
    fn fork_registers_child_under_parent() {
        sched::init().unwrap();
        super::super::table::init();
        vas::init();

        let parent_space = vas::create(ProcessId(1)).unwrap();
        let mut parent_pcb = Pcb::new(ProcessId(1), None, parent_space);
        let parent_thread =
            sched::create_kernel_thread(ProcessId(1), 10, child_noop, 0x10000, THREAD_KERNEL_STACK_SIZE);
        parent_pcb.add_thread(parent_thread.tid);
        table::insert(parent_pcb);

        // Nothing is dispatched on this CPU yet, so this `schedule()` just
        // pops `parent_thread` off the ready queue and installs it as
        // `current` without ever reaching `switch_context`.
        sched::schedule();
        assert_eq!(sched::current_tid(), Some(parent_thread.tid));

        let child_pid = fork(child_noop, 10).unwrap();
        assert_ne!(child_pid, ProcessId(1));
        let parent = table::get(ProcessId(1)).unwrap();
        assert_eq!(parent.lock().children(), &[child_pid]);
        assert!(table::get(child_pid).is_some());
    }
}
