//! Interrupt router (component B).
//!
//! Holds a table of vector -> handler and delegates hardware specifics
//! (masking, EOI, priority, spurious filtering) to a single installed
//! [`InterruptController`] implementation, chosen once at [`init`]. The
//! concrete PIC/IOAPIC+LAPIC register layouts are external collaborators;
//! this module only defines the trait they implement and ships a
//! [`NullController`] test double so the router itself is host-testable.

extern crate alloc;

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult, StateError},
    sync::once_lock::GlobalState,
};

/// Architecture-independent IRQ number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u32);

impl IrqNumber {
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for IrqNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

pub type IrqHandler = fn(IrqNumber);

/// Maximum number of vectors the router tracks.
pub const MAX_IRQ: u32 = 256;

/// The reserved vector used by [`kernel_panic`] to stop every other CPU.
pub const PANIC_INT: u32 = MAX_IRQ - 1;

/// The reserved vector a wake-up sends to force a remote CPU to
/// re-dispatch (§4.H "SMP": "a wake on a CPU other than the current sends
/// an IPI"). Distinct from [`PANIC_INT`] so a reschedule can never be
/// mistaken for the broadcast that freezes every CPU.
pub const RESCHEDULE_INT: u32 = MAX_IRQ - 2;

/// Outcome of asking the controller whether a vector's interrupt was
/// spurious (no corresponding device actually asserted it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpuriousCheck {
    Regular,
    Spurious,
}

/// Hardware interrupt controller contract. Exactly one implementation is
/// installed at boot (a PIC driver or an IOAPIC+LAPIC driver); the router
/// dispatches to it polymorphically and never hard-codes either.
pub trait InterruptController: Send + Sync {
    fn enable(&self, irq: IrqNumber) -> KernelResult<()>;
    fn disable(&self, irq: IrqNumber) -> KernelResult<()>;
    fn acknowledge(&self, irq: IrqNumber) -> KernelResult<()>;
    fn eoi(&self, irq: IrqNumber) -> KernelResult<()>;
    fn set_priority(&self, irq: IrqNumber, priority: u8) -> KernelResult<()>;
    fn is_pending(&self, irq: IrqNumber) -> KernelResult<bool>;
    /// Spurious-IRQ filtering must run before any handler for the vector.
    fn handle_spurious(&self, vector: u32) -> SpuriousCheck;
    /// Maps an IRQ to its hardware interrupt line, or -1 if unsupported.
    fn get_irq_int_line(&self, irq: IrqNumber) -> i32;
    /// Sends an IPI carrying `vector` to `target_cpu`.
    fn send_ipi(&self, target_cpu: u8, vector: u8);
}

/// Test/no-hardware double used until a real controller is wired in.
pub struct NullController;

impl InterruptController for NullController {
    fn enable(&self, _irq: IrqNumber) -> KernelResult<()> {
        Ok(())
    }
    fn disable(&self, _irq: IrqNumber) -> KernelResult<()> {
        Ok(())
    }
    fn acknowledge(&self, _irq: IrqNumber) -> KernelResult<()> {
        Ok(())
    }
    fn eoi(&self, _irq: IrqNumber) -> KernelResult<()> {
        Ok(())
    }
    fn set_priority(&self, _irq: IrqNumber, _priority: u8) -> KernelResult<()> {
        Ok(())
    }
    fn is_pending(&self, _irq: IrqNumber) -> KernelResult<bool> {
        Ok(false)
    }
    fn handle_spurious(&self, _vector: u32) -> SpuriousCheck {
        SpuriousCheck::Regular
    }
    fn get_irq_int_line(&self, _irq: IrqNumber) -> i32 {
        -1
    }
    fn send_ipi(&self, _target_cpu: u8, _vector: u8) {}
}

struct IrqManager {
    handlers: BTreeMap<u32, IrqHandler>,
    exceptions: BTreeMap<u32, IrqHandler>,
    controller: &'static dyn InterruptController,
    dispatch_count: u64,
}

impl IrqManager {
    fn new(controller: &'static dyn InterruptController) -> Self {
        Self {
            handlers: BTreeMap::new(),
            exceptions: BTreeMap::new(),
            controller,
            dispatch_count: 0,
        }
    }

    fn register(&mut self, irq: IrqNumber, handler: IrqHandler) -> KernelResult<()> {
        if irq.0 >= MAX_IRQ {
            return Err(KernelError::State(StateError::UnauthorizedInterruptLine { irq: irq.0 }));
        }
        let table = if irq.0 < 32 {
            &mut self.exceptions
        } else {
            &mut self.handlers
        };
        if table.contains_key(&irq.0) {
            return Err(KernelError::State(StateError::InterruptAlreadyRegistered {
                irq: irq.0,
            }));
        }
        table.insert(irq.0, handler);
        Ok(())
    }

    fn unregister(&mut self, irq: IrqNumber) -> KernelResult<()> {
        let table = if irq.0 < 32 {
            &mut self.exceptions
        } else {
            &mut self.handlers
        };
        if table.remove(&irq.0).is_none() {
            return Err(KernelError::State(StateError::InterruptNotRegistered { irq: irq.0 }));
        }
        Ok(())
    }

    /// Vector dispatch policy: spurious filter first, then exceptions
    /// (vector < 32) or IRQ handlers, always followed by EOI unless the
    /// vector was spurious (in which case the controller already settled it).
    fn dispatch(&mut self, irq: IrqNumber) {
        if self.controller.handle_spurious(irq.0) == SpuriousCheck::Spurious {
            return;
        }
        self.dispatch_count += 1;
        let table = if irq.0 < 32 {
            &self.exceptions
        } else {
            &self.handlers
        };
        if let Some(&handler) = table.get(&irq.0) {
            handler(irq);
        }
        let _ = self.controller.eoi(irq);
    }
}

static IRQ_MANAGER: GlobalState<Mutex<IrqManager>> = GlobalState::new();
static CONTROLLER: GlobalState<&'static dyn InterruptController> = GlobalState::new();

/// Installs `controller` and creates the global router. Must be called
/// exactly once, after the controller itself has been brought up.
pub fn init(controller: &'static dyn InterruptController) -> KernelResult<()> {
    CONTROLLER
        .init(controller)
        .map_err(|_| KernelError::State(StateError::HandlerAlreadyExists))?;
    IRQ_MANAGER
        .init(Mutex::new(IrqManager::new(controller)))
        .map_err(|_| KernelError::State(StateError::HandlerAlreadyExists))?;
    kprintln!("[IRQ] interrupt router initialized");
    Ok(())
}

/// Returns the installed hardware controller, used by [`crate::arch::x86::cpu::send_ipi`].
pub fn controller() -> &'static dyn InterruptController {
    CONTROLLER.with(|c| *c).unwrap_or(&NullController)
}

pub fn register_irq(irq: IrqNumber, handler: IrqHandler) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().register(irq, handler))
        .unwrap_or(Err(KernelError::State(StateError::NotInitialized {
            subsystem: "irq router",
        })))
}

pub fn remove_irq(irq: IrqNumber) -> KernelResult<()> {
    IRQ_MANAGER
        .with_mut(|mtx| mtx.lock().unregister(irq))
        .unwrap_or(Err(KernelError::State(StateError::NotInitialized {
            subsystem: "irq router",
        })))
}

/// Entry point called by the low-level interrupt stub for every vector.
pub fn dispatch(irq: IrqNumber) {
    IRQ_MANAGER.with_mut(|mtx| mtx.lock().dispatch(irq));
}

pub fn set_irq_mask(irq: IrqNumber, enabled: bool) -> KernelResult<()> {
    let controller = controller();
    if enabled {
        controller.enable(irq)
    } else {
        controller.disable(irq)
    }
}

pub fn set_irq_eoi(irq: IrqNumber) -> KernelResult<()> {
    controller().eoi(irq)
}

pub fn dispatch_count() -> u64 {
    IRQ_MANAGER.with(|mtx| mtx.lock().dispatch_count).unwrap_or(0)
}

/// Broadcasts the reserved panic vector to every other online CPU and halts
/// this one. Used as the last resort for unrecoverable kernel faults.
pub fn kernel_panic(code: u32) -> ! {
    kprintln!("[PANIC] kernel_panic code={code}, broadcasting PANIC_INT");
    for cpu in crate::sched::smp::online_cpus() {
        if cpu != crate::arch::x86::cpu::cpu_id() {
            unsafe { crate::arch::x86::cpu::send_ipi(cpu, PANIC_INT as u8) };
        }
    }
    loop {
        unsafe { crate::arch::x86::cpu::cli() };
        crate::arch::x86::cpu::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_irq: IrqNumber) {}

    #[test]
    fn register_and_dispatch() {
        let _ = init(&NullController);
        assert!(register_irq(IrqNumber::new(33), noop).is_ok());
        assert!(matches!(
            register_irq(IrqNumber::new(33), noop),
            Err(KernelError::State(StateError::InterruptAlreadyRegistered { irq: 33 }))
        ));
        dispatch(IrqNumber::new(33));
        assert!(remove_irq(IrqNumber::new(33)).is_ok());
        assert!(matches!(
            remove_irq(IrqNumber::new(33)),
            Err(KernelError::State(StateError::InterruptNotRegistered { irq: 33 }))
        ));
    }

    #[test]
    fn irq_out_of_range_rejected() {
        let _ = init(&NullController);
        assert!(matches!(
            register_irq(IrqNumber::new(MAX_IRQ), noop),
            Err(KernelError::State(StateError::UnauthorizedInterruptLine { .. }))
        ));
    }
}
