//! CPU identity and online-CPU bookkeeping (§4.H "SMP", §6 "Max CPUs").

extern crate alloc;

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Hard ceiling on the number of CPUs this kernel schedules across.
pub const MAX_CPU_COUNT: usize = 4;

static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(1);
static THIS_CPU_ID: AtomicU8 = AtomicU8::new(0);

/// Records how many CPUs came up during SMP bring-up. Bringing up
/// additional APs is an external collaborator's job (boot trampoline,
/// local APIC); this only records the count the scheduler then places
/// threads across.
pub fn set_online_cpu_count(count: usize) {
    ONLINE_CPUS.store(count.clamp(1, MAX_CPU_COUNT), Ordering::Release);
}

pub fn online_cpu_count() -> usize {
    ONLINE_CPUS.load(Ordering::Acquire)
}

/// Iterates the ids of every online CPU, lowest first.
pub fn online_cpus() -> impl Iterator<Item = u8> {
    0..online_cpu_count() as u8
}

/// Returns this CPU's id. Bare metal would read it from the local APIC;
/// tests and early boot run single-CPU, so this is pinned to 0 until an
/// AP-bringup path sets it (out of scope for this specification).
pub fn current_cpu_id() -> u8 {
    THIS_CPU_ID.load(Ordering::Relaxed)
}

/// Sets this (calling) CPU's id. Called once per CPU during its own
/// bring-up.
///
/// # Safety
/// Must only be called once, by the CPU whose id is being set, before any
/// other code on that CPU reads [`current_cpu_id`].
pub unsafe fn set_current_cpu_id(id: u8) {
    THIS_CPU_ID.store(id, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_cpus_enumerates_lowest_first() {
        set_online_cpu_count(3);
        let ids: alloc::vec::Vec<u8> = online_cpus().collect();
        assert_eq!(ids, alloc::vec![0, 1, 2]);
        set_online_cpu_count(1);
    }
}
