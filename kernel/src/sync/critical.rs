//! IRQ-save critical sections (component F).
//!
//! `enter_critical` disables interrupts, remembering whether they were
//! enabled before, then (on SMP) acquires an optional [`Spinlock`].
//! `exit_critical` reverses both steps in the opposite order. Re-entry by
//! the same CPU on the same lock is safe because [`Spinlock::acquire`] is
//! itself nesting-aware, so `enter_critical` can never deadlock its own
//! holder.

use super::spinlock::Spinlock;
use crate::arch::x86::cpu;

/// Interrupt-enable state captured by [`enter_critical`], consumed exactly
/// once by the matching [`exit_critical`].
#[derive(Debug, Clone, Copy)]
pub struct CriticalState {
    interrupts_were_enabled: bool,
}

/// Disables interrupts and, if `lock` is given, acquires it. Returns the
/// prior interrupt-enable state for [`exit_critical`] to restore.
pub fn enter_critical(lock: Option<&Spinlock>) -> CriticalState {
    let interrupts_were_enabled = cpu::interrupts_enabled();
    unsafe { cpu::cli() };
    if let Some(lock) = lock {
        lock.acquire();
    }
    CriticalState {
        interrupts_were_enabled,
    }
}

/// Releases `lock` (if given) and restores the interrupt state captured by
/// the matching [`enter_critical`].
pub fn exit_critical(state: CriticalState, lock: Option<&Spinlock>) {
    if let Some(lock) = lock {
        lock.release();
    }
    if state.interrupts_were_enabled {
        unsafe { cpu::sti() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_same_cpu_does_not_deadlock() {
        let lock = Spinlock::new();
        let outer = enter_critical(Some(&lock));
        let inner = enter_critical(Some(&lock));
        exit_critical(inner, Some(&lock));
        assert!(lock.is_locked());
        exit_critical(outer, Some(&lock));
        assert!(!lock.is_locked());
    }
}
