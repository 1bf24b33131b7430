//! Architecture layer (component A).
//!
//! Single target: 32-bit x86 ("i686-unknown-none" style). The kernel
//! previously spoke to several architectures through per-arch submodules and
//! cfg dispatch helpers; this tree keeps that shape but with one leaf left
//! under it, since nothing else in this specification runs outside i386.

pub mod x86;

pub use x86::*;
