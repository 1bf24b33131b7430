//! Synchronization primitives (components F and I).
//!
//! `once_lock` is the ambient safe-singleton carrier used by every other
//! module's global tables. `spinlock`/`critical` are the low-level
//! building blocks; `mutex`/`semaphore`/`futex` are built on top of them
//! and the scheduler's block/wake API.

pub mod critical;
pub mod futex;
pub mod mutex;
pub mod once_lock;
pub mod semaphore;
pub mod spinlock;

pub use critical::{enter_critical, exit_critical, CriticalState};
pub use futex::FutexWaitResult;
pub use mutex::{Mutex, MutexFlags};
pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use semaphore::Semaphore;
pub use spinlock::Spinlock;
