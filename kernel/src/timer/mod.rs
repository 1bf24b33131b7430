//! Timer factory (component G).
//!
//! Narrowed from a general software timer wheel down to the specification's
//! two-capability design: a main timer driving the scheduler tick and an RTC
//! timer driving the wall clock, both behind the same polymorphic
//! [`KernelTimer`] capability so neither driver is hard-coded here.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    error::{KernelError, KernelResult, StateError},
    sync::once_lock::GlobalState,
};

/// Default main-timer frequency driving the scheduler tick (Hz).
pub const KERNEL_MAIN_TIMER_FREQ: u32 = 200;
/// Default RTC frequency driving the wall clock (Hz).
pub const KERNEL_RTC_TIMER_FREQ: u32 = 5;

/// Polymorphic hardware-timer capability. The concrete PIT/APIC-timer/RTC
/// register layout is an external collaborator; this is the contract the
/// timer factory consumes.
pub trait KernelTimer: Send + Sync {
    fn get_freq(&self) -> u32;
    fn set_freq(&self, freq: u32) -> KernelResult<()>;
    fn enable(&self);
    fn disable(&self);
    fn set_handler(&self, handler: fn());
    fn remove_handler(&self);
    fn get_irq(&self) -> u32;
}

/// Test/no-hardware double.
pub struct NullTimer {
    freq: core::sync::atomic::AtomicU32,
    irq: u32,
}

impl NullTimer {
    pub const fn new(freq: u32, irq: u32) -> Self {
        Self {
            freq: core::sync::atomic::AtomicU32::new(freq),
            irq,
        }
    }
}

impl KernelTimer for NullTimer {
    fn get_freq(&self) -> u32 {
        self.freq.load(Ordering::Relaxed)
    }
    fn set_freq(&self, freq: u32) -> KernelResult<()> {
        self.freq.store(freq, Ordering::Relaxed);
        Ok(())
    }
    fn enable(&self) {}
    fn disable(&self) {}
    fn set_handler(&self, _handler: fn()) {}
    fn remove_handler(&self) {}
    fn get_irq(&self) -> u32 {
        self.irq
    }
}

struct TimerFactory {
    main: &'static dyn KernelTimer,
    rtc: &'static dyn KernelTimer,
    schedule_callback: Option<fn()>,
}

static FACTORY: GlobalState<spin::Mutex<TimerFactory>> = GlobalState::new();
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);
static RTC_TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Brings up the timer factory with the given main and RTC capabilities.
/// `main` is configured to [`KERNEL_MAIN_TIMER_FREQ`] and `rtc` to
/// [`KERNEL_RTC_TIMER_FREQ`].
pub fn time_init(main: &'static dyn KernelTimer, rtc: &'static dyn KernelTimer) -> KernelResult<()> {
    main.set_freq(KERNEL_MAIN_TIMER_FREQ)?;
    rtc.set_freq(KERNEL_RTC_TIMER_FREQ)?;
    main.set_handler(main_tick);
    rtc.set_handler(rtc_tick);
    main.enable();
    rtc.enable();
    FACTORY
        .init(spin::Mutex::new(TimerFactory {
            main,
            rtc,
            schedule_callback: None,
        }))
        .map_err(|_| KernelError::State(StateError::HandlerAlreadyExists))?;
    kprintln!(
        "[TIMER] main={}Hz rtc={}Hz",
        KERNEL_MAIN_TIMER_FREQ,
        KERNEL_RTC_TIMER_FREQ
    );
    Ok(())
}

/// Registers the callback invoked from within the main-timer tick handler
/// (normally the scheduler's `tick()` entry point).
pub fn register_schedule_callback(cb: fn()) {
    FACTORY.with_mut(|f| f.lock().schedule_callback = Some(cb));
}

/// Called by the main timer's interrupt handler. Advances the tick counter
/// and, if a schedule callback is registered, invokes it.
fn main_tick() {
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
    let cb = FACTORY.with(|f| f.lock().schedule_callback).flatten();
    if let Some(cb) = cb {
        cb();
    }
}

/// Called by the RTC timer's interrupt handler. Advances the wall-clock tick
/// counter; this kernel does not otherwise interpret wall-clock time.
fn rtc_tick() {
    RTC_TICK_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Returns the number of main-timer ticks observed since [`time_init`].
pub fn tick_count() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Returns monotonic uptime in nanoseconds, derived from the main timer's
/// tick count and configured frequency.
pub fn uptime_ns() -> u64 {
    let freq = FACTORY.with(|f| f.lock().main.get_freq()).unwrap_or(KERNEL_MAIN_TIMER_FREQ);
    let freq = freq.max(1) as u64;
    TICK_COUNT.load(Ordering::Relaxed) * (1_000_000_000 / freq)
}

/// Busy-waits for approximately `ticks` main-timer ticks. Once a schedule
/// callback is registered, tick progress drives the scheduler on its own, so
/// this becomes a no-op rather than competing with it for CPU time.
pub fn wait_no_sched(ticks: u64) {
    if FACTORY.with(|f| f.lock().schedule_callback.is_some()).unwrap_or(false) {
        return;
    }
    let target = TICK_COUNT.load(Ordering::Relaxed) + ticks;
    while TICK_COUNT.load(Ordering::Relaxed) < target {
        crate::arch::x86::cpu::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MAIN: NullTimer = NullTimer::new(KERNEL_MAIN_TIMER_FREQ, 0);
    static RTC: NullTimer = NullTimer::new(KERNEL_RTC_TIMER_FREQ, 8);

    #[test]
    fn init_sets_frequencies() {
        let _ = time_init(&MAIN, &RTC);
        assert_eq!(MAIN.get_freq(), KERNEL_MAIN_TIMER_FREQ);
        assert_eq!(RTC.get_freq(), KERNEL_RTC_TIMER_FREQ);
    }

    #[test]
    fn tick_advances_uptime() {
        let _ = time_init(&MAIN, &RTC);
        let before = tick_count();
        main_tick();
        assert_eq!(tick_count(), before + 1);
    }

    #[test]
    fn schedule_callback_runs_on_tick() {
        use core::sync::atomic::AtomicBool;
        static RAN: AtomicBool = AtomicBool::new(false);
        fn mark() {
            RAN.store(true, Ordering::Relaxed);
        }
        let _ = time_init(&MAIN, &RTC);
        register_schedule_callback(mark);
        main_tick();
        assert!(RAN.load(Ordering::Relaxed));
    }
}
