//! Scheduler (component H): thread control blocks, per-CPU ready/sleep
//! queues, SMP placement, and the dispatcher itself.

pub mod queue;
pub mod scheduler;
pub mod smp;
pub mod task;

pub use scheduler::{
    block_current, create_kernel_thread, current, current_tid, exit_current, init, join, lookup,
    schedule, sched_sleep, wake, yield_cpu,
};
pub use task::{
    BlockObject, ElevationStack, ProcessId, Tcb, TcbInner, TerminationCause, ThreadId,
    ThreadState, UserStackDescriptor, IDLE_PRIORITY, MAX_ELEVATION_DEPTH, NUM_PRIORITIES,
};

/// Runs this CPU's idle loop: dispatches forever, letting `schedule()` pick
/// real work whenever it is ready and otherwise halting between ticks.
pub fn run() -> ! {
    loop {
        schedule();
        crate::arch::x86::cpu::hlt();
    }
}
