//! 32-bit x86 architecture primitives (component A).
//!
//! No crate in the example pack targets bare i386 (everything reachable
//! depends on the 64-bit `x86_64` crate even when described as "multiboot"),
//! so this module hand-rolls the primitives the rest of the kernel needs
//! directly on top of `core::arch::asm!`.

pub mod cpu;
pub mod context;

pub use context::Context;
