//! Scheduler core (component H): per-CPU dispatch, tick, sleep, block/wake.
//!
//! Fork/exit/waitpid live in [`crate::process`] since they also touch the
//! address space and process table; this module owns everything that is
//! purely about thread scheduling.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::x86::context::{switch_context, Context};
use crate::arch::x86::cpu;
use crate::error::KernelResult;
use crate::sync::once_lock::GlobalState;

use super::queue::{ReadyQueue, SleepQueue};
use super::smp;
use super::task::{
    alloc_tid, BlockObject, ProcessId, Tcb, ThreadId, ThreadState, IDLE_PRIORITY,
};

// ReadyQueue::new/SleepQueue::new are not const (they build an
// array-of-VecDeque at runtime), so per-CPU state is built lazily on first
// use instead of living in a `static`; see `per_cpu()` below.
struct PerCpuState {
    ready: Mutex<ReadyQueue>,
    sleep: Mutex<SleepQueue>,
    current: Mutex<Option<Arc<Tcb>>>,
    idle: Mutex<Option<Arc<Tcb>>>,
    idle_schedule_count: core::sync::atomic::AtomicU64,
    /// The thread this CPU is switching away from, set immediately before
    /// `switch_context` and drained immediately after it returns — by
    /// whichever thread resumes there, not necessarily the one that set it.
    /// Requeuing `prev` only happens here, once its register image is
    /// actually saved, instead of before the switch where another CPU could
    /// race in and resume a not-yet-saved context.
    handoff: Mutex<Option<Arc<Tcb>>>,
}

impl PerCpuState {
    fn new() -> Self {
        Self {
            ready: Mutex::new(ReadyQueue::new()),
            sleep: Mutex::new(SleepQueue::new()),
            current: Mutex::new(None),
            idle: Mutex::new(None),
            idle_schedule_count: core::sync::atomic::AtomicU64::new(0),
            handoff: Mutex::new(None),
        }
    }

    fn idle_schedule_count_inc(&self) {
        self.idle_schedule_count
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    /// Number of times this CPU has dispatched its idle thread, for
    /// observability (§4.H "idle").
    pub fn idle_schedule_count(&self) -> u64 {
        self.idle_schedule_count
            .load(core::sync::atomic::Ordering::Relaxed)
    }
}

static CPUS: GlobalState<Mutex<BTreeMap<u8, Arc<PerCpuState>>>> = GlobalState::new();
static THREAD_TABLE: GlobalState<Mutex<BTreeMap<ThreadId, Arc<Tcb>>>> = GlobalState::new();
static JOIN_WAITERS: GlobalState<Mutex<BTreeMap<ThreadId, Vec<ThreadId>>>> = GlobalState::new();

fn per_cpu(id: u8) -> Arc<PerCpuState> {
    CPUS.with(|cpus| {
        let mut map = cpus.lock();
        map.entry(id)
            .or_insert_with(|| Arc::new(PerCpuState::new()))
            .clone()
    })
    .expect("scheduler not initialized")
}

/// Brings up the scheduler: per-CPU queues and one idle thread per online
/// CPU, at [`IDLE_PRIORITY`].
pub fn init() -> KernelResult<()> {
    let _ = CPUS.init(Mutex::new(BTreeMap::new()));
    let _ = THREAD_TABLE.init(Mutex::new(BTreeMap::new()));
    let _ = JOIN_WAITERS.init(Mutex::new(BTreeMap::new()));

    for cpu_id in smp::online_cpus() {
        let cpu = per_cpu(cpu_id);
        let idle = Tcb::new(
            alloc_tid(),
            ProcessId(0),
            IDLE_PRIORITY,
            0,
            crate::process::THREAD_KERNEL_STACK_SIZE,
            Context::new(),
        );
        idle.set_cpu_affinity(cpu_id);
        register_thread(idle.clone());
        *cpu.idle.lock() = Some(idle);
    }
    crate::timer::register_schedule_callback(tick);
    let _ = crate::irq::register_irq(crate::irq::IrqNumber::new(crate::irq::RESCHEDULE_INT), |_irq| {
        schedule();
    });
    kprintln!("[SCHED] scheduler initialized for {} CPU(s)", smp::online_cpu_count());
    Ok(())
}

fn register_thread(thread: Arc<Tcb>) {
    THREAD_TABLE.with(|t| t.lock().insert(thread.tid, thread.clone()));
}

pub fn lookup(tid: ThreadId) -> Option<Arc<Tcb>> {
    THREAD_TABLE.with(|t| t.lock().get(&tid).cloned()).flatten()
}

/// Picks the CPU with the shortest ready queue, tie-breaking on lowest CPU
/// id (§4.H "SMP": least-loaded placement at thread creation).
fn least_loaded_cpu() -> u8 {
    let mut best_cpu = 0u8;
    let mut best_len = usize::MAX;
    for cpu_id in smp::online_cpus() {
        let len = per_cpu(cpu_id).ready.lock().len();
        if len < best_len {
            best_len = len;
            best_cpu = cpu_id;
        }
    }
    best_cpu
}

/// Creates a new kernel thread, placing it on the least-loaded CPU.
/// `entry` is the function the thread starts executing in kernel mode.
pub fn create_kernel_thread(
    pid: ProcessId,
    priority: u8,
    entry: extern "C" fn() -> !,
    kernel_stack_top: usize,
    kernel_stack_size: usize,
) -> Arc<Tcb> {
    let context = Context::init(entry as usize, kernel_stack_top);
    let thread = Tcb::new(
        alloc_tid(),
        pid,
        priority,
        kernel_stack_top - kernel_stack_size,
        kernel_stack_size,
        context,
    );
    register_thread(thread.clone());
    let cpu_id = least_loaded_cpu();
    thread.set_cpu_affinity(cpu_id);
    enqueue_ready(cpu_id, thread.clone());
    thread
}

fn enqueue_ready(cpu_id: u8, thread: Arc<Tcb>) {
    per_cpu(cpu_id).ready.lock().push(thread);
}

/// Returns the thread currently running on this CPU, if dispatch has
/// started.
pub fn current() -> Option<Arc<Tcb>> {
    per_cpu(smp::current_cpu_id()).current.lock().clone()
}

pub fn current_tid() -> Option<ThreadId> {
    current().map(|t| t.tid)
}

/// Cooperative or preemptive entry into the dispatcher: picks the next
/// runnable thread for this CPU and, if it differs from the one running,
/// performs the context switch.
pub fn schedule() {
    let cpu = per_cpu(smp::current_cpu_id());
    let next = {
        let mut ready = cpu.ready.lock();
        ready.pop_highest()
    };
    let next = next.unwrap_or_else(|| {
        cpu.idle_schedule_count_inc();
        cpu.idle.lock().clone().expect("idle thread missing")
    });

    let prev = cpu.current.lock().replace(next.clone());
    next.slice_remaining.store(1, core::sync::atomic::Ordering::Relaxed);
    next.set_state(ThreadState::Running);

    if let Some(prev) = prev {
        if prev.tid == next.tid {
            finish_handoff(&cpu);
            return;
        }
        *cpu.handoff.lock() = Some(prev.clone());
        // SAFETY: `prev` is this CPU's outgoing thread and `next` is the
        // incoming one. `next` was already removed from the ready queue
        // above, and `prev` is not requeued until `finish_handoff` runs
        // after the switch below, once its register image is known to be
        // saved — so no other CPU can observe either thread's context in a
        // half-written state.
        unsafe { switch_context(&mut *prev.context_ptr(), &*next.context_ptr()) };
    }

    // However we got here — fell through from the switch above, or this
    // thread is being resumed by some other CPU's switch into it — finish
    // requeuing whatever thread this CPU most recently switched away from.
    finish_handoff(&cpu);
}

/// Requeues the thread recorded in `cpu.handoff`, if any and if it is still
/// Ready (it may have transitioned to Sleeping/Blocked/Zombie by the time
/// this runs).
fn finish_handoff(cpu: &PerCpuState) {
    if let Some(prev) = cpu.handoff.lock().take() {
        if prev.state() == ThreadState::Ready || prev.state() == ThreadState::Running {
            prev.set_state(ThreadState::Ready);
            enqueue_ready(smp::current_cpu_id(), prev);
        }
    }
}

/// Voluntarily gives up the remainder of the current time slice.
pub fn yield_cpu() {
    if let Some(cur) = current() {
        cur.set_state(ThreadState::Ready);
    }
    schedule();
}

/// Called from the main timer's tick handler (§4.G). Advances the sleep
/// queue, decrements the current thread's slice, and re-dispatches on
/// expiry.
pub fn tick() {
    let now = crate::timer::uptime_ns();
    let cpu = per_cpu(smp::current_cpu_id());

    let woken = cpu.sleep.lock().drain_expired(now);
    for thread in woken {
        thread.set_block_object(None);
        enqueue_ready(smp::current_cpu_id(), thread);
    }

    if let Some(cur) = cpu.current.lock().clone() {
        if cur.idle {
            return;
        }
        let remaining = cur
            .slice_remaining
            .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
        if remaining <= 1 {
            schedule();
        }
    }
}

/// Sleeps the calling thread for `ms` milliseconds (§4.H "Sleep").
pub fn sched_sleep(ms: u64) {
    let cur = match current() {
        Some(t) => t,
        None => return,
    };
    let wake_at = crate::timer::uptime_ns() + ms * 1_000_000;
    cur.set_wake_time_ns(wake_at);
    per_cpu(smp::current_cpu_id()).sleep.lock().insert(cur);
    schedule();
}

/// Blocks the calling thread on `object`; it is the caller's (sync
/// primitive's) job to enqueue it on the object's own wait FIFO first.
pub fn block_current(object: BlockObject) {
    if let Some(cur) = current() {
        cur.set_block_object(Some(object));
        cur.set_state(ThreadState::Blocked);
        schedule();
    }
}

/// Moves a blocked/sleeping thread back to Ready, sending a cross-CPU IPI
/// if it outranks whatever that CPU is currently running (§4.H "SMP").
pub fn wake(thread: Arc<Tcb>) {
    thread.set_block_object(None);
    let target_cpu = thread.cpu_affinity();
    let should_ipi = per_cpu(target_cpu)
        .current
        .lock()
        .as_ref()
        .map(|running| thread.priority() < running.priority())
        .unwrap_or(false);
    enqueue_ready(target_cpu, thread);
    if should_ipi && target_cpu != smp::current_cpu_id() {
        unsafe { cpu::send_ipi(target_cpu, crate::irq::RESCHEDULE_INT as u8) };
    }
}

/// Terminates the calling thread, reaping-independent exit bookkeeping
/// (§4.H "Exit/wait"), waking any thread joined on it.
pub fn exit_current(status: i32, cause: super::task::TerminationCause) -> ! {
    let cur = current().expect("exit with no current thread");
    cur.exit(status, cause);
    let joiners = JOIN_WAITERS
        .with(|m| m.lock().remove(&cur.tid))
        .flatten()
        .unwrap_or_default();
    for tid in joiners {
        if let Some(joiner) = lookup(tid) {
            wake(joiner);
        }
    }
    loop {
        schedule();
    }
}

/// Blocks the caller until `target` is Zombie, then returns its exit
/// status and cause. Does not remove `target` from the thread table
/// (reaping/removal from the process's thread set is the process layer's
/// job once it has copied out what it needs).
pub fn join(target: ThreadId) -> Option<(i32, Option<super::task::TerminationCause>)> {
    loop {
        let thread = lookup(target)?;
        if thread.state() == ThreadState::Zombie {
            return Some(thread.exit_status());
        }
        let me = current_tid()?;
        JOIN_WAITERS
            .with(|m| m.lock().entry(target).or_default().push(me))
            .unwrap_or(());
        block_current(BlockObject::Join(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_loaded_picks_shortest_queue() {
        let _ = CPUS.init(Mutex::new(BTreeMap::new()));
        smp::set_online_cpu_count(2);
        per_cpu(0).ready.lock().push(Tcb::new(
            alloc_tid(),
            ProcessId(1),
            10,
            0,
            0x1000,
            Context::new(),
        ));
        assert_eq!(least_loaded_cpu(), 1);
        smp::set_online_cpu_count(1);
    }
}
