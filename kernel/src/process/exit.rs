//! `exit()` (§4.H "Exit"): terminate the calling thread and, once every
//! thread in its process is Zombie, record the process's own exit status so
//! a parent's `waitpid` can observe it.

use crate::sched::{self, TerminationCause};

use super::table;

/// Terminates the calling thread with `status`, never returning. Once the
/// owning process has no thread left that isn't Zombie, its exit status is
/// recorded on the PCB (first thread to notice wins; later threads of the
/// same process only see a process already marked exited).
pub fn exit(status: i32) -> ! {
    let pid = sched::current().map(|t| t.pid);
    if let Some(pid) = pid {
        if let Some(pcb) = table::get(pid) {
            let mut pcb = pcb.lock();
            if pcb.exit_status().is_none() {
                let all_zombie = pcb.all_threads_zombie(|tid| {
                    sched::lookup(tid)
                        .map(|t| t.state() == sched::ThreadState::Zombie)
                        .unwrap_or(true)
                });
                if all_zombie {
                    pcb.set_exit_status(status, Some(TerminationCause::Normal));
                }
            }
        }
    }
    sched::exit_current(status, TerminationCause::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vas;
    use crate::process::pcb::Pcb;
    use crate::sched::ProcessId;

    #[test]
    fn no_exit_status_before_any_thread_is_zombie() {
        table::init();
        vas::init();
        let space = vas::create(ProcessId(50)).unwrap();
        let mut pcb = Pcb::new(ProcessId(50), None, space);
        pcb.add_thread(crate::sched::ThreadId(1234));
        table::insert(pcb);

        let recorded = table::get(ProcessId(50)).unwrap();
        assert!(recorded.lock().exit_status().is_none());
    }
}
