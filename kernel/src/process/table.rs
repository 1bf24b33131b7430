//! Global process table (§3 "pid unique in [0, MAX_PROCESS)").

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::pcb::Pcb;
use super::MAX_PROCESS;
use crate::error::{KernelError, KernelResult, ResourceError};
use crate::sched::ProcessId;
use crate::sync::once_lock::GlobalState;

static PROCESSES: GlobalState<Mutex<BTreeMap<ProcessId, Arc<Mutex<Pcb>>>>> = GlobalState::new();
static NEXT_PID: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let _ = PROCESSES.init(Mutex::new(BTreeMap::new()));
    kprintln!("[PROCESS] process table initialized (max {})", MAX_PROCESS);
}

/// Allocates a fresh pid. Pid 0 is reserved for `init` and handed out
/// exactly once by [`crate::process::init`]; every other caller gets a
/// strictly increasing id, software-capped at [`MAX_PROCESS`].
pub fn alloc_pid() -> KernelResult<ProcessId> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    if pid as usize >= MAX_PROCESS {
        return Err(KernelError::Resource(ResourceError::NoMoreFreeMemory {
            requested: 1,
        }));
    }
    Ok(ProcessId(pid))
}

pub fn insert(pcb: Pcb) -> Arc<Mutex<Pcb>> {
    let pid = pcb.pid();
    let entry = Arc::new(Mutex::new(pcb));
    PROCESSES.with(|m| m.lock().insert(pid, entry.clone()));
    entry
}

pub fn get(pid: ProcessId) -> Option<Arc<Mutex<Pcb>>> {
    PROCESSES.with(|m| m.lock().get(&pid).cloned()).flatten()
}

pub fn remove(pid: ProcessId) -> Option<Arc<Mutex<Pcb>>> {
    PROCESSES.with(|m| m.lock().remove(&pid)).flatten()
}

pub fn exists(pid: ProcessId) -> bool {
    PROCESSES.with(|m| m.lock().contains_key(&pid)).unwrap_or(false)
}

pub fn count() -> usize {
    PROCESSES.with(|m| m.lock().len()).unwrap_or(0)
}

/// Pids of every process whose `parent` is `parent_pid`, for `waitpid(-1, …)`.
pub fn children_of(parent_pid: ProcessId) -> Vec<ProcessId> {
    PROCESSES
        .with(|m| {
            m.lock()
                .values()
                .filter(|p| p.lock().parent() == Some(parent_pid))
                .map(|p| p.lock().pid())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vas;

    #[test]
    fn insert_get_remove_round_trips() {
        init();
        vas::init();
        let space = vas::create(ProcessId(1)).unwrap();
        insert(Pcb::new(ProcessId(1), None, space));
        assert!(exists(ProcessId(1)));
        assert_eq!(get(ProcessId(1)).unwrap().lock().pid(), ProcessId(1));
        assert!(remove(ProcessId(1)).is_some());
        assert!(!exists(ProcessId(1)));
    }

    #[test]
    fn children_of_filters_by_parent() {
        init();
        vas::init();
        let s2 = vas::create(ProcessId(2)).unwrap();
        let s3 = vas::create(ProcessId(3)).unwrap();
        let s4 = vas::create(ProcessId(4)).unwrap();
        insert(Pcb::new(ProcessId(2), Some(ProcessId(1)), s2));
        insert(Pcb::new(ProcessId(3), Some(ProcessId(1)), s3));
        insert(Pcb::new(ProcessId(4), Some(ProcessId(99)), s4));
        let mut kids = children_of(ProcessId(1));
        kids.sort();
        assert_eq!(kids, alloc::vec![ProcessId(2), ProcessId(3)]);
    }
}
