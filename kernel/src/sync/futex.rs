//! Futex: block/wake keyed by the physical address of a user word
//! (component I, §3 "Futex", §4.I "Futex wait/wake").
//!
//! The kernel never interprets the word at `addr` beyond the single
//! compare; everything else (what "expected" means, fairness beyond FIFO)
//! is userspace's problem. Keying on the physical rather than virtual
//! address means two processes that share a mapped page futex on the same
//! bucket, which is the point of a futex.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::error::{ArgumentError, KernelError, KernelResult};
use crate::mm::{vas, VirtAddr};
use crate::sched::{self, BlockObject, ThreadId};
use crate::sync::once_lock::GlobalState;

static BUCKETS: GlobalState<Mutex<BTreeMap<u32, VecDeque<ThreadId>>>> = GlobalState::new();

pub fn init() {
    let _ = BUCKETS.init(Mutex::new(BTreeMap::new()));
}

/// Outcome of [`wait`]: either the thread blocked and was later woken, or
/// the value didn't match and the kernel returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexWaitResult {
    Woken,
    WouldBlock,
}

fn physical_key(addr: VirtAddr) -> KernelResult<u32> {
    vas::translate_current(addr)
        .map(|p| p.as_u32())
        .ok_or(KernelError::Argument(ArgumentError::NullPointer))
}

/// Blocks the calling thread on the bucket for `addr`'s physical page,
/// provided `*addr == expected` at the moment of the check.
pub fn wait(addr: VirtAddr, current_value: u32, expected: u32) -> KernelResult<FutexWaitResult> {
    if current_value != expected {
        return Ok(FutexWaitResult::WouldBlock);
    }
    let key = physical_key(addr)?;
    let me = sched::current_tid().ok_or(KernelError::Argument(ArgumentError::NullPointer))?;

    BUCKETS
        .with(|b| b.lock().entry(key).or_default().push_back(me))
        .ok_or(KernelError::Argument(ArgumentError::NullPointer))?;

    sched::block_current(BlockObject::Futex(key as u64));
    Ok(FutexWaitResult::Woken)
}

/// Wakes up to `count` waiters queued on `addr`'s physical page, FIFO.
/// Returns the number actually woken.
pub fn wake(addr: VirtAddr, count: u32) -> KernelResult<u32> {
    let key = physical_key(addr)?;
    let woken_tids: alloc::vec::Vec<ThreadId> = BUCKETS
        .with(|b| {
            let mut buckets = b.lock();
            let mut out = alloc::vec::Vec::new();
            if let Some(bucket) = buckets.get_mut(&key) {
                for _ in 0..count {
                    match bucket.pop_front() {
                        Some(tid) => out.push(tid),
                        None => break,
                    }
                }
                if bucket.is_empty() {
                    buckets.remove(&key);
                }
            }
            out
        })
        .unwrap_or_default();

    let woken = woken_tids.len() as u32;
    for tid in woken_tids {
        if let Some(tcb) = sched::lookup(tid) {
            sched::wake(tcb);
        }
    }
    Ok(woken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_mismatch_returns_would_block_without_translation() {
        // current_value != expected short-circuits before any address
        // translation is attempted, so this is safe to call without a
        // running address space.
        let result = wait(VirtAddr::new(0x1000), 4, 5);
        assert_eq!(result, Ok(FutexWaitResult::WouldBlock));
    }
}
