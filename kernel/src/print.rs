//! Logging macros over the installed `Console`.
//!
//! `kprintln!` is unconditional kernel output; `kdbg!` is compiled out
//! entirely in release builds, mirroring how debug-only tracing is usually
//! kept out of a production kernel image.

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

#[cfg(debug_assertions)]
#[macro_export]
macro_rules! kdbg {
    ($($arg:tt)*) => ($crate::kprintln!("[dbg] {}", format_args!($($arg)*)));
}

#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! kdbg {
    ($($arg:tt)*) => {};
}
