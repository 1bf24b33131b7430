//! Thread control block (component H, §3 "Thread control block").
//!
//! TCBs are shared between the global thread table, per-CPU ready/sleep
//! queues and sync-object wait FIFOs. Per the design notes (§9) on cyclic
//! pointer graphs, the primary reference is the integer [`ThreadId`]; the
//! table maps it to a reference-counted [`Tcb`] so queues hold cheap
//! clones instead of raw pointers with no clear owner.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::x86::context::Context;

/// Thread identifier, unique for the process's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Process identifier. Bounded to [`crate::process::MAX_PROCESS`] as a
/// software cap only (§9 open question: no PCID usage on i386).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

/// Scheduling priority: 0 is highest, [`IDLE_PRIORITY`] is lowest.
pub const NUM_PRIORITIES: usize = 64;
pub const IDLE_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Sleeping,
    Blocked,
    Zombie,
}

/// Why a thread stopped running, reported to `waitpid` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// Ran to completion / called `exit`.
    Normal,
    /// Faulted in user mode with no registered handler (§4.D step 4).
    Segfault,
    /// Was blocked on a sync object that was destroyed (§5).
    ResourceDestroyed,
}

/// A thread's user-mode stack, when it has one (kernel threads do not).
#[derive(Debug, Clone, Copy)]
pub struct UserStackDescriptor {
    pub base_low: u32,
    pub size: u32,
}

/// What a `Blocked` thread is waiting on, used only to route a
/// `ResourceDestroyed` wakeup; the wait FIFO itself lives on the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockObject {
    Mutex(u64),
    Semaphore(u64),
    Futex(u64),
    Join(ThreadId),
}

/// Fixed-capacity stack of elevated priorities, one entry pushed per held
/// priority-elevating mutex (§9 open question: elevation stacks, not a
/// single scalar, so nested acquisitions restore the right intermediate
/// priority on `post`).
pub const MAX_ELEVATION_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct ElevationStack {
    base_priority: u8,
    stack: [u8; MAX_ELEVATION_DEPTH],
    len: usize,
}

impl ElevationStack {
    pub const fn new(base_priority: u8) -> Self {
        Self {
            base_priority,
            stack: [0; MAX_ELEVATION_DEPTH],
            len: 0,
        }
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    /// Changes the unelevated priority (`SCHED_SET_PARAMS`). Does not
    /// disturb any elevation currently held on the stack.
    pub fn set_base_priority(&mut self, priority: u8) {
        self.base_priority = priority;
    }

    /// Returns the effective priority: the minimum (highest-priority
    /// number-wise) of the base priority and every still-held elevation.
    pub fn effective_priority(&self) -> u8 {
        let mut min = self.base_priority;
        for &p in &self.stack[..self.len] {
            if p < min {
                min = p;
            }
        }
        min
    }

    /// Pushes a new elevation ceiling. Silently caps at
    /// [`MAX_ELEVATION_DEPTH`] (nested-mutex depth is bounded in practice).
    pub fn push(&mut self, ceiling: u8) {
        if self.len < MAX_ELEVATION_DEPTH {
            self.stack[self.len] = ceiling;
            self.len += 1;
        }
    }

    pub fn pop(&mut self) {
        if self.len > 0 {
            self.len -= 1;
        }
    }
}

/// Mutable TCB fields, guarded by a single per-thread lock. The scheduler
/// locks at most one TCB at a time beyond its own queue locks, so this
/// does not introduce additional lock-ordering hazards.
pub struct TcbInner {
    pub state: ThreadState,
    pub elevation: ElevationStack,
    pub wake_time_ns: u64,
    pub block_object: Option<BlockObject>,
    pub user_stack: Option<UserStackDescriptor>,
    pub exit_status: i32,
    pub termination_cause: Option<TerminationCause>,
    pub cpu_affinity: u8,
}

/// A thread's saved register image lives outside `TcbInner`'s lock: the
/// scheduler must be able to write into it across a raw `switch_context`
/// call without holding a lock for as long as the thread stays
/// descheduled, which would starve every other CPU trying to read the
/// rest of the TCB (priority, block object, ...) in the meantime.
/// Discipline instead of a lock keeps this sound: a thread's context is
/// only ever touched by the CPU that currently "owns" it (the CPU it is
/// running on, or the CPU performing the switch that hands it off).
pub struct Tcb {
    pub tid: ThreadId,
    pub pid: ProcessId,
    pub kernel_stack_base: usize,
    pub kernel_stack_size: usize,
    pub slice_remaining: AtomicUsize,
    pub idle: bool,
    context: core::cell::UnsafeCell<Context>,
    inner: Mutex<TcbInner>,
}

// SAFETY: see the discipline note on `Tcb` above; `context` is never
// accessed concurrently by construction of the scheduler's switch path.
unsafe impl Sync for Tcb {}

/// No sleeper is scheduled; used as the TCB's initial wake-time.
pub const WAKE_TIME_NONE: u64 = u64::MAX;

impl Tcb {
    pub fn new(
        tid: ThreadId,
        pid: ProcessId,
        priority: u8,
        kernel_stack_base: usize,
        kernel_stack_size: usize,
        context: Context,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid,
            pid,
            kernel_stack_base,
            kernel_stack_size,
            slice_remaining: AtomicUsize::new(1),
            idle: priority == IDLE_PRIORITY,
            context: core::cell::UnsafeCell::new(context),
            inner: Mutex::new(TcbInner {
                state: ThreadState::Ready,
                elevation: ElevationStack::new(priority),
                wake_time_ns: WAKE_TIME_NONE,
                block_object: None,
                user_stack: None,
                exit_status: 0,
                termination_cause: None,
                cpu_affinity: 0,
            }),
        })
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().elevation.effective_priority()
    }

    pub fn base_priority(&self) -> u8 {
        self.inner.lock().elevation.base_priority()
    }

    /// `SCHED_SET_PARAMS`: changes this thread's unelevated priority.
    pub fn set_base_priority(&self, priority: u8) {
        self.inner.lock().elevation.set_base_priority(priority);
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ThreadState) {
        self.inner.lock().state = state;
    }

    pub fn wake_time_ns(&self) -> u64 {
        self.inner.lock().wake_time_ns
    }

    pub fn set_wake_time_ns(&self, t: u64) {
        self.inner.lock().wake_time_ns = t;
    }

    pub fn set_block_object(&self, obj: Option<BlockObject>) {
        self.inner.lock().block_object = obj;
    }

    pub fn elevate(&self, ceiling: u8) {
        self.inner.lock().elevation.push(ceiling);
    }

    pub fn de_elevate(&self) {
        self.inner.lock().elevation.pop();
    }

    pub fn cpu_affinity(&self) -> u8 {
        self.inner.lock().cpu_affinity
    }

    pub fn set_cpu_affinity(&self, cpu: u8) {
        self.inner.lock().cpu_affinity = cpu;
    }

    pub fn exit(&self, status: i32, cause: TerminationCause) {
        let mut inner = self.inner.lock();
        inner.exit_status = status;
        inner.termination_cause = Some(cause);
        inner.state = ThreadState::Zombie;
    }

    pub fn exit_status(&self) -> (i32, Option<TerminationCause>) {
        let inner = self.inner.lock();
        (inner.exit_status, inner.termination_cause)
    }

    pub fn user_stack(&self) -> Option<UserStackDescriptor> {
        self.inner.lock().user_stack
    }

    pub fn set_user_stack(&self, desc: UserStackDescriptor) {
        self.inner.lock().user_stack = Some(desc);
    }

    /// Raw pointer to this thread's saved register image, for the
    /// scheduler's switch path only. See the discipline note on [`Tcb`].
    pub fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh, process-unique thread id.
pub fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}
