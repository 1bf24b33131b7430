//! Counting semaphore (component I, §3 "Semaphore").
//!
//! `level` is signed: positive means tokens available, negative means
//! `-level` threads are queued waiting for one. `pend`/`post` are the
//! textbook `fetch_sub`/`fetch_add` pair; the FIFO wait queue is what makes
//! "wake one" pick the longest-waiting thread.

extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;

use crate::error::{KernelError, KernelResult, ResourceError, SyncError};
use crate::sched::{self, BlockObject, ThreadId};

use super::spinlock::Spinlock;

struct SemaphoreState {
    level: i32,
    waiters: VecDeque<ThreadId>,
    initialized: bool,
    destroyed: bool,
}

pub struct Semaphore {
    lock: Spinlock,
    state: UnsafeCell<SemaphoreState>,
}

// SAFETY: every access to `state` goes through `with_state`, which holds
// `lock` for the duration.
unsafe impl Sync for Semaphore {}

enum PendOutcome {
    Acquired,
    Block,
    Destroyed,
    Uninitialized,
}

impl Semaphore {
    pub fn new(initial_level: i32) -> Self {
        Self {
            lock: Spinlock::new(),
            state: UnsafeCell::new(SemaphoreState {
                level: initial_level,
                waiters: VecDeque::new(),
                initialized: true,
                destroyed: false,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SemaphoreState) -> R) -> R {
        let guard = super::critical::enter_critical(Some(&self.lock));
        // SAFETY: `guard` holds `self.lock` for its whole lifetime.
        let result = f(unsafe { &mut *self.state.get() });
        super::critical::exit_critical(guard, Some(&self.lock));
        result
    }

    fn key(&self) -> u64 {
        self as *const Self as u64
    }

    /// Takes a token, blocking if none is available (§4.I "Semaphore pend").
    pub fn pend(&self) -> KernelResult<()> {
        let me = sched::current_tid().ok_or(KernelError::Sync(SyncError::SemUninitialized))?;
        let outcome = self.with_state(|s| {
            if s.destroyed {
                return PendOutcome::Destroyed;
            }
            if !s.initialized {
                return PendOutcome::Uninitialized;
            }
            s.level -= 1;
            if s.level < 0 {
                s.waiters.push_back(me);
                PendOutcome::Block
            } else {
                PendOutcome::Acquired
            }
        });

        match outcome {
            PendOutcome::Acquired => Ok(()),
            PendOutcome::Block => {
                sched::block_current(BlockObject::Semaphore(self.key()));
                if self.with_state(|s| s.destroyed) {
                    Err(KernelError::Resource(ResourceError::ResourceDestroyed))
                } else {
                    Ok(())
                }
            }
            PendOutcome::Destroyed => Err(KernelError::Resource(ResourceError::ResourceDestroyed)),
            PendOutcome::Uninitialized => Err(KernelError::Sync(SyncError::SemUninitialized)),
        }
    }

    /// Returns a token, waking the longest-waiting thread if any were
    /// queued (§4.I "Semaphore post").
    pub fn post(&self) -> KernelResult<()> {
        let woken = self.with_state(|s| {
            let was_negative = s.level < 0;
            s.level += 1;
            if was_negative {
                s.waiters.pop_front()
            } else {
                None
            }
        });
        if let Some(tid) = woken {
            if let Some(tcb) = sched::lookup(tid) {
                sched::wake(tcb);
            }
        }
        Ok(())
    }

    /// Unblocks every waiter with `ResourceDestroyed` (§4.I "Destruction").
    pub fn destroy(&self) {
        let waiters = self.with_state(|s| {
            s.destroyed = true;
            core::mem::take(&mut s.waiters)
        });
        for tid in waiters {
            if let Some(tcb) = sched::lookup(tid) {
                sched::wake(tcb);
            }
        }
    }

    pub fn level(&self) -> i32 {
        self.with_state(|s| s.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_without_waiters_just_increments() {
        let s = Semaphore::new(0);
        assert_eq!(s.post(), Ok(()));
        assert_eq!(s.level(), 1);
    }

    #[test]
    fn pend_without_a_current_thread_errors() {
        let s = Semaphore::new(1);
        assert!(s.pend().is_err());
    }

    #[test]
    fn level_goes_negative_while_waiters_are_queued() {
        let s = Semaphore::new(0);
        s.with_state(|st| {
            st.level -= 1;
            st.waiters.push_back(ThreadId(7));
        });
        assert_eq!(s.level(), -1);
        let woken = s.with_state(|st| {
            st.level += 1;
            st.waiters.pop_front()
        });
        assert_eq!(woken, Some(ThreadId(7)));
    }
}
