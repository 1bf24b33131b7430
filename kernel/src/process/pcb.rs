//! Process control block (§3 "Process control block (PCB)").

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::mm::vas::AddressSpace;
use crate::sched::{ProcessId, TerminationCause, ThreadId};

/// One process: its address space, thread set, and parent/child linkage.
///
/// A process terminates once every thread in `threads` is Zombie; the
/// parent's `waitpid` reaps it by removing it from the global table.
pub struct Pcb {
    pid: ProcessId,
    parent: Option<ProcessId>,
    address_space: Arc<Mutex<AddressSpace>>,
    threads: Vec<ThreadId>,
    children: Vec<ProcessId>,
    exit_status: Option<(i32, Option<TerminationCause>)>,
}

impl Pcb {
    pub fn new(pid: ProcessId, parent: Option<ProcessId>, address_space: Arc<Mutex<AddressSpace>>) -> Self {
        Self {
            pid,
            parent,
            address_space,
            threads: Vec::new(),
            children: Vec::new(),
            exit_status: None,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    pub fn address_space(&self) -> Arc<Mutex<AddressSpace>> {
        self.address_space.clone()
    }

    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn add_thread(&mut self, tid: ThreadId) {
        self.threads.push(tid);
    }

    pub fn remove_thread(&mut self, tid: ThreadId) {
        self.threads.retain(|&t| t != tid);
    }

    pub fn children(&self) -> &[ProcessId] {
        &self.children
    }

    pub fn add_child(&mut self, pid: ProcessId) {
        self.children.push(pid);
    }

    pub fn remove_child(&mut self, pid: ProcessId) {
        self.children.retain(|&c| c != pid);
    }

    pub fn exit_status(&self) -> Option<(i32, Option<TerminationCause>)> {
        self.exit_status
    }

    pub fn set_exit_status(&mut self, status: i32, cause: Option<TerminationCause>) {
        self.exit_status = Some((status, cause));
    }

    /// A process is terminated once it has no live (non-Zombie) thread; the
    /// caller supplies each thread's current zombie-ness since `Pcb` does
    /// not itself hold TCBs.
    pub fn all_threads_zombie(&self, is_zombie: impl Fn(ThreadId) -> bool) -> bool {
        !self.threads.is_empty() && self.threads.iter().all(|&t| is_zombie(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vas;

    #[test]
    fn thread_and_child_bookkeeping() {
        vas::init();
        let space = vas::create(ProcessId(1)).unwrap();
        let mut pcb = Pcb::new(ProcessId(1), None, space);
        pcb.add_thread(ThreadId(10));
        pcb.add_thread(ThreadId(11));
        assert_eq!(pcb.threads(), &[ThreadId(10), ThreadId(11)]);
        pcb.remove_thread(ThreadId(10));
        assert_eq!(pcb.threads(), &[ThreadId(11)]);

        pcb.add_child(ProcessId(2));
        assert_eq!(pcb.children(), &[ProcessId(2)]);
        pcb.remove_child(ProcessId(2));
        assert!(pcb.children().is_empty());
    }

    #[test]
    fn terminated_once_every_thread_zombie() {
        vas::init();
        let space = vas::create(ProcessId(3)).unwrap();
        let mut pcb = Pcb::new(ProcessId(3), None, space);
        pcb.add_thread(ThreadId(20));
        pcb.add_thread(ThreadId(21));
        assert!(!pcb.all_threads_zombie(|_| false));
        assert!(!pcb.all_threads_zombie(|t| t == ThreadId(20)));
        assert!(pcb.all_threads_zombie(|_| true));
    }
}
