//! `waitpid()` (§4.H "Wait"): block for a specific child or any child to
//! exit, then reap it.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult, ResourceError};
use crate::mm::vas;
use crate::sched::{self, ProcessId, TerminationCause};

use super::table;

/// Waits for a child to terminate and reaps it, returning its pid, exit
/// status and termination cause.
///
/// `pid >= 0` waits for that specific child; `pid < 0` waits for any child
/// of the caller (the first one observed Zombie is reaped).
pub fn waitpid(pid: i64) -> KernelResult<(ProcessId, i32, Option<TerminationCause>)> {
    let parent_pid = sched::current()
        .map(|t| t.pid)
        .ok_or(KernelError::Resource(ResourceError::NoSuchId { id: 0 }))?;

    if pid >= 0 {
        let child_pid = ProcessId(pid as u64);
        if !table::children_of(parent_pid).contains(&child_pid) {
            return Err(KernelError::Resource(ResourceError::NoSuchId { id: pid as u64 }));
        }
        reap(parent_pid, child_pid)
    } else {
        loop {
            let children: Vec<ProcessId> = table::children_of(parent_pid);
            if children.is_empty() {
                return Err(KernelError::Resource(ResourceError::NoSuchId { id: u64::MAX }));
            }
            if let Some(zombie) = children
                .into_iter()
                .find(|&c| table::get(c).map(|p| p.lock().exit_status().is_some()).unwrap_or(false))
            {
                return reap(parent_pid, zombie);
            }
            sched::yield_cpu();
        }
    }
}

/// Blocks until every thread of `child_pid` is Zombie, then removes it from
/// the process table and the parent's child list and tears down its address
/// space.
fn reap(parent_pid: ProcessId, child_pid: ProcessId) -> KernelResult<(ProcessId, i32, Option<TerminationCause>)> {
    let child_pcb = table::get(child_pid).ok_or(KernelError::Resource(ResourceError::NoSuchId { id: child_pid.0 }))?;
    let threads = child_pcb.lock().threads().to_vec();
    for tid in threads {
        sched::join(tid);
    }

    let (status, cause) = child_pcb.lock().exit_status().unwrap_or((0, None));
    table::remove(child_pid);
    let _ = vas::destroy(child_pid);
    if let Some(parent_pcb) = table::get(parent_pid) {
        parent_pcb.lock().remove_child(child_pid);
    }
    Ok((child_pid, status, cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::Pcb;

    #[test]
    fn waitpid_rejects_non_child_pid() {
        table::init();
        vas::init();
        sched::init().unwrap();

        let parent_space = vas::create(ProcessId(1)).unwrap();
        let parent_thread =
            sched::create_kernel_thread(ProcessId(1), 5, idle_entry, 0x20000, super::super::THREAD_KERNEL_STACK_SIZE);
        let mut parent_pcb = Pcb::new(ProcessId(1), None, parent_space);
        parent_pcb.add_thread(parent_thread.tid);
        table::insert(parent_pcb);
        sched::schedule();
        assert_eq!(sched::current_tid(), Some(parent_thread.tid));

        assert!(waitpid(999).is_err());
    }

    extern "C" fn idle_entry() -> ! {
        loop {
            sched::yield_cpu();
        }
    }
}
