//! Per-CPU ready queue and sleep queue (§3 "Ready queue"/"Sleep queue").

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::task::{Tcb, ThreadState, NUM_PRIORITIES};

/// Priority-indexed array of FIFO lists plus a bitmap of non-empty bands,
/// so picking the highest-priority runnable thread never scans empty
/// bands.
pub struct ReadyQueue {
    bands: [VecDeque<Arc<Tcb>>; NUM_PRIORITIES],
    non_empty: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            bands: core::array::from_fn(|_| VecDeque::new()),
            non_empty: 0,
        }
    }

    /// Enqueues at the tail of `thread`'s priority band (§4.H tie-break:
    /// a thread just made Ready goes to the tail of its band).
    pub fn push(&mut self, thread: Arc<Tcb>) {
        let prio = thread.priority() as usize;
        thread.set_state(ThreadState::Ready);
        self.bands[prio].push_back(thread);
        self.non_empty |= 1 << prio;
    }

    /// Removes and returns the head of the highest (numerically lowest)
    /// non-empty priority band.
    pub fn pop_highest(&mut self) -> Option<Arc<Tcb>> {
        let prio = self.non_empty.trailing_zeros() as usize;
        if prio >= NUM_PRIORITIES {
            return None;
        }
        let band = &mut self.bands[prio];
        let thread = band.pop_front();
        if band.is_empty() {
            self.non_empty &= !(1 << prio);
        }
        thread
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.non_empty == 0
    }

    /// Removes a specific thread from wherever it sits in its band,
    /// used when a sync object is destroyed out from under a ready thread
    /// is not possible (ready threads are never also blocked), but needed
    /// by tests that want to retract a just-pushed thread.
    pub fn remove(&mut self, tid: super::task::ThreadId) -> Option<Arc<Tcb>> {
        for (prio, band) in self.bands.iter_mut().enumerate() {
            if let Some(pos) = band.iter().position(|t| t.tid == tid) {
                let thread = band.remove(pos);
                if band.is_empty() {
                    self.non_empty &= !(1 << prio);
                }
                return thread;
            }
        }
        None
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Threads waiting for a future wake-time, kept sorted ascending so the
/// head always has the earliest wake (§3 invariant).
pub struct SleepQueue {
    entries: VecDeque<Arc<Tcb>>,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, thread: Arc<Tcb>) {
        thread.set_state(ThreadState::Sleeping);
        let wake = thread.wake_time_ns();
        let pos = self
            .entries
            .iter()
            .position(|t| t.wake_time_ns() > wake)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, thread);
    }

    /// Removes and returns every thread whose wake-time has arrived.
    pub fn drain_expired(&mut self, now_ns: u64) -> alloc::vec::Vec<Arc<Tcb>> {
        let mut woken = alloc::vec::Vec::new();
        while let Some(front) = self.entries.front() {
            if front.wake_time_ns() > now_ns {
                break;
            }
            woken.push(self.entries.pop_front().unwrap());
        }
        woken
    }

    pub fn remove(&mut self, tid: super::task::ThreadId) -> Option<Arc<Tcb>> {
        let pos = self.entries.iter().position(|t| t.tid == tid)?;
        self.entries.remove(pos)
    }

    pub fn head_wake_time(&self) -> Option<u64> {
        self.entries.front().map(|t| t.wake_time_ns())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::context::Context;
    use crate::sched::task::{alloc_tid, ProcessId, Tcb};

    fn thread(prio: u8) -> Arc<Tcb> {
        Tcb::new(alloc_tid(), ProcessId(1), prio, 0, 0x1000, Context::new())
    }

    #[test]
    fn ready_queue_strict_priority_then_fifo() {
        let mut q = ReadyQueue::new();
        let low_a = thread(20);
        let low_b = thread(20);
        let high = thread(5);
        q.push(low_a.clone());
        q.push(low_b.clone());
        q.push(high.clone());

        assert_eq!(q.pop_highest().unwrap().tid, high.tid);
        assert_eq!(q.pop_highest().unwrap().tid, low_a.tid);
        assert_eq!(q.pop_highest().unwrap().tid, low_b.tid);
        assert!(q.pop_highest().is_none());
    }

    #[test]
    fn sleep_queue_orders_by_wake_time() {
        let mut q = SleepQueue::new();
        let t1 = thread(10);
        t1.set_wake_time_ns(300);
        let t2 = thread(10);
        t2.set_wake_time_ns(100);
        let t3 = thread(10);
        t3.set_wake_time_ns(200);
        q.insert(t1.clone());
        q.insert(t2.clone());
        q.insert(t3.clone());

        assert_eq!(q.head_wake_time(), Some(100));
        let woken = q.drain_expired(200);
        assert_eq!(woken.len(), 2);
        assert_eq!(woken[0].tid, t2.tid);
        assert_eq!(woken[1].tid, t3.tid);
        assert_eq!(q.head_wake_time(), Some(300));
    }
}
